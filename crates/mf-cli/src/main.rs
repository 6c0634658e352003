//! MultiFi CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use mf_core::{ActiveSet, REQUEST_GRADIENT, REQUEST_HESSIAN, REQUEST_VALUE, Response, Variables};
use mf_model::{GraphSpec, ModelGraph, ModelId};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "multifi")]
#[command(about = "MultiFi - multi-fidelity model evaluation")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one point
    Eval {
        /// Model graph (JSON or YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Variable values, comma separated
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
        point: Vec<f64>,

        /// Request bits per function (1 value, 2 gradient, 4 Hessian), comma
        /// separated. A single entry applies to every function.
        #[arg(long, value_delimiter = ',')]
        asv: Option<Vec<u8>>,

        /// Evaluate this model instead of the graph root.
        #[arg(long)]
        model: Option<String>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Evaluate many points
    Batch {
        /// Model graph (JSON or YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// JSON array of points
        #[arg(long)]
        points: PathBuf,

        /// Submit every point before collecting any result.
        #[arg(long)]
        nowait: bool,

        /// Request bits per function (as for `eval`).
        #[arg(long, value_delimiter = ',')]
        asv: Option<Vec<u8>>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Eval { config, point, asv, model, output } => {
            cmd_eval(&config, point, asv, model.as_deref(), output.as_ref())
        }
        Commands::Batch { config, points, nowait, asv, output } => {
            cmd_batch(&config, &points, nowait, asv, output.as_ref())
        }
    }
}

fn cmd_eval(
    config: &Path,
    point: Vec<f64>,
    asv: Option<Vec<u8>>,
    model: Option<&str>,
    output: Option<&PathBuf>,
) -> Result<()> {
    let (mut graph, root) = load_graph(config)?;
    let id = match model {
        Some(name) => graph
            .find(name)
            .ok_or_else(|| anyhow::anyhow!("model '{name}' is not in {}", config.display()))?,
        None => root,
    };
    let set = request(&graph, id, asv.as_deref())?;
    let response = graph.evaluate(id, &Variables::new(point), &set)?;
    tracing::info!(model = graph.name(id), "evaluation complete");

    let output_json = serde_json::json!({
        "model": graph.name(id),
        "response": response_json(&response),
        "counters": counters_json(&graph),
    });
    write_json(output, output_json)
}

fn cmd_batch(
    config: &Path,
    points: &Path,
    nowait: bool,
    asv: Option<Vec<u8>>,
    output: Option<&PathBuf>,
) -> Result<()> {
    let (mut graph, root) = load_graph(config)?;
    let points: Vec<Vec<f64>> = serde_json::from_slice(&std::fs::read(points)?)?;
    let set = request(&graph, root, asv.as_deref())?;
    tracing::info!(points = points.len(), nowait, "evaluating batch");

    let mut responses = serde_json::Map::new();
    if nowait {
        for p in &points {
            graph.evaluate_nowait(root, &Variables::new(p.clone()), &set)?;
        }
        for (id, response) in graph.synchronize(root)? {
            responses.insert(id.to_string(), response_json(&response));
        }
    } else {
        for (i, p) in points.iter().enumerate() {
            let response = graph.evaluate(root, &Variables::new(p.clone()), &set)?;
            responses.insert((i + 1).to_string(), response_json(&response));
        }
    }

    let output_json = serde_json::json!({
        "model": graph.name(root),
        "responses": responses,
        "counters": counters_json(&graph),
    });
    write_json(output, output_json)
}

fn load_graph(path: &Path) -> Result<(ModelGraph, ModelId)> {
    tracing::info!(path = %path.display(), "loading model graph");
    let bytes = std::fs::read(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    let spec: GraphSpec = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        // Default: YAML (serde_yaml_ng).
        serde_yaml_ng::from_slice(&bytes)?
    };
    let (graph, root) = spec.build()?;
    tracing::info!(models = graph.len(), root = graph.name(root), "model graph built");
    Ok((graph, root))
}

/// The model's default request, or `asv` over every variable.
fn request(graph: &ModelGraph, id: ModelId, asv: Option<&[u8]>) -> Result<ActiveSet> {
    let Some(asv) = asv else {
        return Ok(graph.default_active_set(id));
    };
    let n = graph.n_functions(id);
    let bits = match asv {
        [one] => vec![*one; n],
        many if many.len() == n => many.to_vec(),
        many => anyhow::bail!("--asv has {} entries, model '{}' has {n} functions", many.len(), graph.name(id)),
    };
    Ok(ActiveSet::from_request(bits, (0..graph.n_variables(id)).collect())?)
}

fn response_json(response: &Response) -> serde_json::Value {
    let set = response.active_set();
    let n = response.n_functions();
    let pick = |bit: u8| (0..n).filter(move |&i| set.get(i) & bit != 0);
    let values: serde_json::Map<String, serde_json::Value> =
        pick(REQUEST_VALUE).map(|i| (i.to_string(), response.value(i).into())).collect();
    let gradients: serde_json::Map<String, serde_json::Value> = pick(REQUEST_GRADIENT)
        .map(|i| (i.to_string(), response.gradient(i).to_vec().into()))
        .collect();
    let hessians: serde_json::Map<String, serde_json::Value> = pick(REQUEST_HESSIAN)
        .map(|i| {
            let h = response.hessian(i);
            let rows: Vec<Vec<f64>> = h.row_iter().map(|r| r.iter().copied().collect()).collect();
            (i.to_string(), serde_json::json!(rows))
        })
        .collect();
    serde_json::json!({
        "asv": set.request(),
        "derivative_vars": set.derivative_vars(),
        "values": values,
        "gradients": gradients,
        "hessians": hessians,
        "metadata": response.metadata(),
    })
}

fn counters_json(graph: &ModelGraph) -> serde_json::Value {
    let counters: serde_json::Map<String, serde_json::Value> = graph
        .ids()
        .filter_map(|id| {
            let c = graph.counters(id)?;
            Some((graph.name(id).to_string(), serde_json::to_value(c).ok()?))
        })
        .collect();
    serde_json::Value::Object(counters)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
