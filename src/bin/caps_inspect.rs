//! caps-inspect - parse capability descriptors and show how they resolve
//!
//! Each descriptor (from the command line, or one per line on stdin) is parsed and
//! classified. Output is one JSON object per descriptor.

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::io::BufRead;

use shmframe::{classify, CapsParser, PixelLayout, StreamFormat};

#[derive(Parser, Debug)]
#[command(
    name = "caps-inspect",
    about = "Parse shared-memory capability descriptors and resolve their pixel layout"
)]
struct Args {
    /// Descriptors to inspect; read from stdin when none are given
    descriptors: Vec<String>,

    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    descriptor: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<StreamFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    layout: Option<PixelLayout>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn inspect<'a>(parser: &CapsParser, descriptor: &'a str) -> Report<'a> {
    let mut report = Report {
        descriptor,
        format: None,
        layout: None,
        source_len: None,
        error: None,
    };
    let format = match parser.parse(descriptor) {
        Ok(format) => format,
        Err(err) => {
            report.error = Some(format!("parse: {}", err));
            return report;
        }
    };
    match classify(&format) {
        Ok(layout) => {
            report.source_len = layout.source_len().ok();
            report.layout = Some(layout);
        }
        Err(reason) => report.error = Some(format!("unsupported: {}", reason)),
    }
    report.format = Some(format);
    report
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let parser = CapsParser::new()?;

    let descriptors = if args.descriptors.is_empty() {
        std::io::stdin()
            .lock()
            .lines()
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect()
    } else {
        args.descriptors
    };

    for descriptor in &descriptors {
        let report = inspect(&parser, descriptor);
        let line = if args.pretty {
            serde_json::to_string_pretty(&report)?
        } else {
            serde_json::to_string(&report)?
        };
        println!("{}", line);
    }
    Ok(())
}
