//! `clyde resolve`: resolve only, optionally exporting the graph as JSON.

use std::path::{Path, PathBuf};

use crate::ops::{self, Context, Error};

pub fn resolve(ctx: &Context, root_dir: PathBuf, graph_out: Option<&Path>) -> Result<(), Error> {
    let graph = ops::resolve_graph(ctx, &root_dir)?;
    let export = graph.export();

    println!(
        "resolved {} package(s), {} edge(s)",
        export.nodes.len(),
        export.edges.len()
    );
    for node in &export.nodes {
        println!("  {}@{} ({})", node.name, node.version, node.package_type);
    }

    if let Some(path) = graph_out {
        let json = serde_json::to_string_pretty(&export).expect("graph export serializes");
        std::fs::write(path, json)?;
        println!("graph written to {}", path.display());
    }
    Ok(())
}
