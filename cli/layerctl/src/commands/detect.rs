//! Compression detection for local files.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use plfm_layer_arena::{detect_compression, Compression};
use serde::Serialize;
use tabled::Tabled;

use crate::output::print_output;

use super::CommandContext;

/// Print the compression of each file, judged by its magic number.
#[derive(Debug, Args)]
pub struct DetectCommand {
    /// Files to inspect.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Debug, Serialize, Tabled)]
struct Detected {
    #[tabled(rename = "File")]
    file: String,

    #[tabled(rename = "Compression")]
    compression: String,
}

impl DetectCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let rows = self
            .files
            .iter()
            .map(|path| {
                Ok(Detected {
                    file: path.display().to_string(),
                    compression: detect_file(path)?.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        print_output(&rows, ctx.format);
        Ok(())
    }
}

fn detect_file(path: &Path) -> Result<Compression> {
    let file = File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
    let mut prefix = Vec::with_capacity(4);
    file.take(4)
        .read_to_end(&mut prefix)
        .with_context(|| format!("unable to read {}", path.display()))?;
    Ok(detect_compression(&prefix))
}
