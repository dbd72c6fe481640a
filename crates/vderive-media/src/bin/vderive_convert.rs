//! Probe/convert helper.
//!
//! ```text
//! vderive-convert [--dir <path>] analyze
//! vderive-convert [--dir <path>] extract <numFrames>
//! vderive-convert [--dir <path>] transcode <FLAG value>... <extension>
//! ```
//!
//! The working directory defaults to `$VDERIVE_WORK_DIR`, then `.`.

use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use vderive_media::{run_convert, ConvertOutput, FfmpegRunner};
use vderive_models::ConvertCommand;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (dir, rest) = parse_args(std::env::args().skip(1).collect())?;
    let command = ConvertCommand::parse_args(rest.as_slice()).context("invalid arguments")?;

    let output = run_convert(&dir, &command, &FfmpegRunner::new())
        .await
        .with_context(|| format!("{} failed in {}", command.name(), dir.display()))?;

    match output {
        ConvertOutput::Metadata(meta) => println!("{}", serde_json::to_string_pretty(&meta)?),
        ConvertOutput::Frames(n) => println!("extracted {} frames", n),
        ConvertOutput::Rendition(path) => println!("wrote {}", path.display()),
    }
    Ok(())
}

fn parse_args(mut args: Vec<String>) -> anyhow::Result<(PathBuf, Vec<String>)> {
    let mut dir = std::env::var("VDERIVE_WORK_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));

    if args.first().map(String::as_str) == Some("--dir") {
        if args.len() < 2 {
            anyhow::bail!("--dir requires a path");
        }
        dir = PathBuf::from(args.remove(1));
        args.remove(0);
    }

    if args.is_empty() {
        anyhow::bail!("usage: vderive-convert [--dir <path>] analyze | extract <n> | transcode <FLAG value>... <ext>");
    }
    Ok((dir, args))
}
