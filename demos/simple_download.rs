use indicatif::MultiProgress;
use splitfetch::observer::ConsoleProgress;
use splitfetch::{DownloadOptions, download, utils};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration
    let url = "https://proof.ovh.net/files/10Mb.dat";
    let output_dir = ".";

    println!("Starting example download...");
    println!("URL: {}", url);

    let client = utils::build_client(Duration::from_secs(10))?;

    let mut output_path = PathBuf::from(output_dir);
    output_path.push(utils::get_filename_from_url(url));

    let options = DownloadOptions {
        workers: 4,
        ..DownloadOptions::default()
    };
    let progress = ConsoleProgress::new(MultiProgress::new());

    let report = download(
        &client,
        url,
        &output_path,
        &options,
        &progress,
        &CancellationToken::new(),
    )
    .await?;

    println!(
        "Downloaded {} bytes to {} in {:.2}s ({:?})",
        report.bytes,
        report.path.display(),
        report.elapsed.as_secs_f64(),
        report.mode
    );
    Ok(())
}
