//! Fetch layers through a single proxy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use plfm_layer_arena::{Arena, Digest, FetchProxy, Layer, ProxyError, RemoteLayer};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tabled::Tabled;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::CliError;
use crate::output::{print_output, print_success};

use super::CommandContext;

/// Fetch, decompress, and verify layers into the arena.
#[derive(Debug, Args)]
pub struct FetchCommand {
    /// Layers to fetch, as DIGEST=URI.
    #[arg(required = true, value_parser = parse_layer)]
    layers: Vec<LayerArg>,

    /// Request header sent with every layer fetch, as NAME:VALUE.
    #[arg(long = "header", short = 'H', value_parser = parse_header)]
    headers: Vec<(HeaderName, HeaderValue)>,

    /// Copy the verified layers into this directory before cleanup.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct LayerArg {
    digest: Digest,
    uri: String,
}

#[derive(Debug, Serialize, Tabled)]
struct FetchedLayer {
    #[tabled(rename = "Digest")]
    digest: String,

    #[tabled(rename = "Path")]
    path: String,

    #[tabled(rename = "Size")]
    size: u64,
}

impl FetchCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            headers.append(name, value);
        }
        let layers: Vec<RemoteLayer> = self
            .layers
            .into_iter()
            .map(|arg| RemoteLayer::new(arg.digest, arg.uri).with_headers(headers.clone()))
            .collect();

        let arena = Arena::open(reqwest::Client::new(), &ctx.config).with_context(|| {
            format!(
                "unable to create arena root {}",
                ctx.config.root_dir.display()
            )
        })?;
        let arena = Arc::new(arena);
        let proxy = arena.fetcher();

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, abandoning fetch");
                    cancel.cancel();
                }
            })
        };

        let result = fetch_layers(&proxy, &cancel, &layers, self.out.as_deref()).await;
        interrupt.abort();

        // Clean up even when the fetch failed; report the fetch error first.
        let released = proxy.close();
        let cleared = arena.close();
        let rows = result?;
        released?;
        cleared?;

        print_output(&rows, ctx.format);
        if let Some(out) = &self.out {
            print_success(
                &format!("copied {} layer(s) to {}", rows.len(), out.display()),
                ctx.format,
            );
        }
        Ok(())
    }
}

async fn fetch_layers(
    proxy: &FetchProxy,
    cancel: &CancellationToken,
    layers: &[RemoteLayer],
    out: Option<&Path>,
) -> Result<Vec<FetchedLayer>> {
    proxy.fetch(cancel, layers).await.map_err(|err| match err {
        ProxyError::Cancelled { .. } => anyhow::Error::from(CliError::Interrupted),
        err => err.into(),
    })?;

    if let Some(out) = out {
        tokio::fs::create_dir_all(out)
            .await
            .with_context(|| format!("unable to create {}", out.display()))?;
    }

    let mut rows = Vec::with_capacity(layers.len());
    for layer in layers {
        let digest = layer.digest().to_string();
        let path = layer
            .local_path()
            .with_context(|| format!("layer {digest} has no local path"))?;
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("unable to stat {}", path.display()))?
            .len();

        let path = match out {
            Some(out) => {
                let dest = out.join(digest.replace(':', "-"));
                tokio::fs::copy(path, &dest)
                    .await
                    .with_context(|| format!("unable to copy layer to {}", dest.display()))?;
                info!(digest = %digest, dest = %dest.display(), "copied layer");
                dest
            }
            None => path.to_path_buf(),
        };

        rows.push(FetchedLayer {
            digest,
            path: path.display().to_string(),
            size,
        });
    }
    Ok(rows)
}

fn parse_layer(arg: &str) -> Result<LayerArg, CliError> {
    let (digest, uri) = arg
        .split_once('=')
        .filter(|(_, uri)| !uri.is_empty())
        .ok_or_else(|| CliError::InvalidLayer(arg.to_string()))?;
    let digest = digest
        .parse()
        .map_err(|_| CliError::InvalidLayer(arg.to_string()))?;
    Ok(LayerArg {
        digest,
        uri: uri.to_string(),
    })
}

fn parse_header(arg: &str) -> Result<(HeaderName, HeaderValue), CliError> {
    let invalid = || CliError::InvalidHeader(arg.to_string());
    let (name, value) = arg.split_once(':').ok_or_else(invalid)?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
    let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_layer() {
        let digest = Digest::sha256_of(b"layer");
        // The URI may itself contain '='.
        let arg = format!("{digest}=https://registry.local/blobs/{digest}?token=a=b");
        let layer = parse_layer(&arg).unwrap();
        assert_eq!(layer.digest, digest);
        assert_eq!(
            layer.uri,
            format!("https://registry.local/blobs/{digest}?token=a=b")
        );
    }

    #[test]
    fn test_parse_layer_rejects_malformed() {
        let digest = Digest::sha256_of(b"layer");
        for arg in [
            "no-separator".to_string(),
            format!("{digest}="),
            "sha256:abc=https://registry.local/blob".to_string(),
            "md5:00=https://registry.local/blob".to_string(),
        ] {
            assert!(
                matches!(parse_layer(&arg), Err(CliError::InvalidLayer(_))),
                "{arg}"
            );
        }
    }

    #[test]
    fn test_parse_header() {
        let (name, value) = parse_header("Authorization: Bearer abc").unwrap();
        assert_eq!(name.as_str(), "authorization");
        assert_eq!(value, "Bearer abc");

        assert!(matches!(
            parse_header("no colon"),
            Err(CliError::InvalidHeader(_))
        ));
        assert!(matches!(
            parse_header("bad name: x"),
            Err(CliError::InvalidHeader(_))
        ));
    }
}
