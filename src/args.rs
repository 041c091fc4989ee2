use clap::Parser;

/// Download a file over HTTP by fetching byte ranges in parallel.
///
/// The server is probed first. If it accepts byte ranges and reports a
/// length, the file is split into one range per worker; otherwise it is
/// downloaded as a single stream.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// The URL of the file to download.
    pub url: String,

    /// The number of concurrent workers (capped at 8).
    #[arg(short = 't', long, visible_short_alias = 'c')]
    pub threads: Option<usize>,

    /// The name of the output file. Defaults to the last segment of the URL.
    #[arg(short, long)]
    pub output: Option<String>,

    /// The directory to save the file in. Defaults to the current directory.
    #[arg(short = 'd', long)]
    pub dir: Option<String>,

    /// Retries per range after a transient network failure.
    #[arg(long)]
    pub retries: Option<u32>,

    /// Write buffer size in bytes.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Write each range to its own part file and concatenate them at the end.
    #[arg(long)]
    pub part_files: bool,

    /// Hide progress bars.
    #[arg(short, long)]
    pub quiet: bool,

    /// Log debug output.
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_threads_aliases() {
        let args = Args::parse_from(["splitfetch", "http://example.com/a.iso", "-c", "6"]);
        assert_eq!(args.url, "http://example.com/a.iso");
        assert_eq!(args.threads, Some(6));

        let args = Args::parse_from(["splitfetch", "-t", "2", "--part-files", "http://x/y"]);
        assert_eq!(args.threads, Some(2));
        assert!(args.part_files);
        assert_eq!(args.output, None);
    }
}
