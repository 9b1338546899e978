// Prepares a host for the provider: base directory ownership plus the
// cloud-hypervisor binary and firmware.

use std::{
    os::unix::fs::{PermissionsExt, chown},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info};

use chv_provider::utils::tracing::init_tracing;

const CH_NAME: &str = "cloud-hypervisor";
const FIRMWARE_NAME: &str = "firmware";

const UID: u32 = 65532;
const GID: u32 = 65532;

#[derive(Debug, Parser)]
#[command(name = "prepare-host", about = "Prepare a host for the provider")]
struct Cli {
    /// Download missing binaries instead of failing when they are absent.
    #[arg(long)]
    download: bool,

    /// Provider base directory.
    #[arg(long, default_value = "/var/lib/chv-provider")]
    provider_base_path: PathBuf,

    /// Directory holding the cloud-hypervisor binary.
    #[arg(long, default_value = "/usr/local/bin/cloud-hypervisor")]
    cloud_hypervisor_bin_path: PathBuf,

    /// Sub-directory of the cloud-hypervisor binary.
    #[arg(long, default_value = "version")]
    cloud_hypervisor_bin_sub_dir: String,

    /// Download URL of the cloud-hypervisor binary.
    #[arg(long, default_value = "")]
    cloud_hypervisor_bin_url: String,

    /// Directory holding the cloud-hypervisor firmware.
    #[arg(long, default_value = "/usr/local/bin/cloud-hypervisor-firmware")]
    cloud_hypervisor_firmware_path: PathBuf,

    /// Sub-directory of the cloud-hypervisor firmware.
    #[arg(long, default_value = "version")]
    cloud_hypervisor_firmware_sub_dir: String,

    /// Download URL of the cloud-hypervisor firmware.
    #[arg(long, default_value = "")]
    cloud_hypervisor_firmware_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    info!("starting host preparation");

    ensure_base_dir(&cli.provider_base_path).await?;

    let ch_path = cli
        .cloud_hypervisor_bin_path
        .join(&cli.cloud_hypervisor_bin_sub_dir)
        .join(CH_NAME);
    ensure_file(
        &ch_path,
        &cli.cloud_hypervisor_bin_url,
        cli.download,
        true,
    )
    .await?;

    let firmware_path = cli
        .cloud_hypervisor_firmware_path
        .join(&cli.cloud_hypervisor_firmware_sub_dir)
        .join(FIRMWARE_NAME);
    ensure_file(
        &firmware_path,
        &cli.cloud_hypervisor_firmware_url,
        cli.download,
        false,
    )
    .await?;

    info!("host preparation done");
    Ok(())
}

async fn ensure_base_dir(base_path: &Path) -> Result<()> {
    match fs::metadata(base_path).await {
        Ok(metadata) if !metadata.is_dir() => {
            bail!("path exists but is not a directory: {}", base_path.display());
        }
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("creating base path {}", base_path.display());
            fs::create_dir_all(base_path).await?;
            fs::set_permissions(base_path, std::fs::Permissions::from_mode(0o755)).await?;
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", base_path.display()));
        }
    }

    debug!("setting owner {UID}:{GID} on {}", base_path.display());
    chown(base_path, Some(UID), Some(GID))
        .with_context(|| format!("failed to set owner of {}", base_path.display()))?;
    Ok(())
}

async fn ensure_file(path: &Path, url: &str, download: bool, executable: bool) -> Result<()> {
    if file_present(path).await {
        debug!("file {} already present", path.display());
        return Ok(());
    }

    if !download {
        bail!(
            "file {} is not present and downloading is disabled",
            path.display()
        );
    }
    if url.is_empty() {
        bail!("no download url for {}", path.display());
    }

    fetch(url, path, executable).await
}

async fn file_present(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

async fn fetch(url: &str, target: &Path, executable: bool) -> Result<()> {
    let dir = target
        .parent()
        .with_context(|| format!("no parent directory for {}", target.display()))?;
    fs::create_dir_all(dir).await?;

    info!("downloading {url} to {}", target.display());
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("failed to download {url}"))?;
    if !response.status().is_success() {
        bail!("download of {url} failed with status {}", response.status());
    }

    let mut file = fs::File::create(target)
        .await
        .with_context(|| format!("failed to create {}", target.display()))?;
    let mut stream = response.bytes_stream();
    use futures_util::StreamExt;
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;

    if executable {
        fs::set_permissions(target, std::fs::Permissions::from_mode(0o755)).await?;
    }

    info!("successfully downloaded {}", target.display());
    Ok(())
}
