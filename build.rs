use anyhow::{anyhow, Context};
use std::{env, fs, path::PathBuf};

const PROBE_PACKAGE: &str = "rqtap-probes";
const PROBE_BINARY: &str = "rq_probe";

fn main() -> anyhow::Result<()> {
    // Skip eBPF build if we're already building for the eBPF target
    if env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default() == "bpf" {
        return Ok(());
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let probe_path = out_dir.join(PROBE_BINARY);

    if let Some(reason) = skip_reason() {
        println!("cargo:warning=eBPF compilation skipped: {reason}. rqtap will fail to load its probe.");
        // The loader embeds this file; an empty object is rejected at runtime.
        if !probe_path.exists() {
            fs::write(&probe_path, b"").context("failed to write placeholder probe object")?;
        }
        return Ok(());
    }

    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;

    let cargo_metadata::Package {
        name,
        manifest_path,
        ..
    } = packages
        .into_iter()
        .find(|pkg| pkg.name == PROBE_PACKAGE)
        .ok_or_else(|| anyhow!("{PROBE_PACKAGE} package not found"))?;
    let root_dir = manifest_path
        .parent()
        .ok_or_else(|| anyhow!("no parent for {manifest_path}"))?;

    let ebpf_package = aya_build::Package {
        name: name.as_str(),
        root_dir: root_dir.as_str(),
        ..Default::default()
    };
    aya_build::build_ebpf([ebpf_package], aya_build::Toolchain::default())?;

    if !probe_path.exists() {
        return Err(anyhow!(
            "eBPF probe compilation failed: {} not found",
            probe_path.display()
        ));
    }

    Ok(())
}

fn skip_reason() -> Option<String> {
    println!("cargo:rerun-if-env-changed=RQTAP_SKIP_EBPF_BUILD");

    // eBPF requires Linux
    if env::consts::OS != "linux" {
        return Some(format!("unsupported host {}", env::consts::OS));
    }
    if env::var_os("RQTAP_SKIP_EBPF_BUILD").is_some() {
        return Some("RQTAP_SKIP_EBPF_BUILD is set".to_string());
    }
    if which::which("bpf-linker").is_err() {
        return Some("bpf-linker not found in PATH".to_string());
    }
    None
}
