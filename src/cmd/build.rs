//! `clyde build`

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::error;

use crate::exec::CancellationToken;
use crate::ops::{self, BuildRequest, Context, Error};

#[allow(clippy::too_many_arguments)]
pub async fn build(
    ctx: &Context,
    root_dir: PathBuf,
    jobs: Option<usize>,
    fail_fast: bool,
    timeout_secs: Option<u64>,
    traits: &[String],
) -> Result<(), Error> {
    let traits = parse_traits(traits)?;
    let request = BuildRequest {
        root_dir,
        jobs,
        fail_fast,
        step_timeout: timeout_secs.map(Duration::from_secs),
        traits,
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received, finishing in-flight steps...");
            ctrl_c_cancel.cancel();
        }
    });

    match ops::build(ctx, request, &cancel).await {
        Ok(summary) => {
            println!(
                "✓ built {} package(s): {} compiled, {} object cache hits, {} linked, {} artifact cache hits in {:.2}s",
                summary.linked + summary.artifact_cache_hits,
                summary.compiled,
                summary.object_cache_hits,
                summary.linked,
                summary.artifact_cache_hits,
                summary.wall_time.as_secs_f64(),
            );
            Ok(())
        }
        Err(Error::BuildFailed { summary }) => {
            for failed in &summary.failed_steps {
                error!(step = %failed.step, package = %failed.package, "{}", failed.reason);
                for diagnostic in &failed.diagnostics {
                    eprintln!(
                        "  {}:{}: {}",
                        diagnostic.file.display(),
                        diagnostic.line,
                        diagnostic.message
                    );
                }
            }
            Err(Error::BuildFailed { summary })
        }
        Err(e) => Err(e),
    }
}

fn parse_traits(raw: &[String]) -> Result<BTreeMap<String, String>, Error> {
    let mut traits = BTreeMap::new();
    for item in raw {
        let Some((key, value)) = item.split_once('=') else {
            return Err(Error::InvalidArguments(format!(
                "trait `{item}` must be key=value"
            )));
        };
        traits.insert(key.to_string(), value.to_string());
    }
    Ok(traits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_parse_key_value() {
        let traits = parse_traits(&["profile=release".into(), "arch=arm".into()]).unwrap();
        assert_eq!(traits["profile"], "release");
        assert_eq!(traits["arch"], "arm");
        assert!(parse_traits(&["malformed".into()]).is_err());
    }
}
