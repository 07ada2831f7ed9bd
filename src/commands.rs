use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use deferc_config::{BuildConfig, parse_max_methods};
use deferc_jit::{BuildArtifact, BuildContext, EncodedMethod, ProgramScript, build};
use deferc_metrics::{BuildCounters, BuildProfiler};
use deferc_symbol::MethodTable;
use deferc_utils::PhaseTiming;
use serde::Serialize;
use tracing::{debug, info};

use crate::cli::BuildArgs;

/// Sidecar describing the encoded buffer.
#[derive(Debug, Serialize)]
pub struct Manifest {
    pub methods: Vec<EncodedMethod>,
    /// Object table entries in table-id order.
    pub objects: Vec<String>,
    pub failures: BTreeMap<String, String>,
    pub counters: BuildCounters,
    pub phases: Vec<PhaseTiming>,
}

impl Manifest {
    fn new(artifact: &BuildArtifact, methods: &MethodTable, counters: BuildCounters) -> Self {
        Self {
            methods: artifact.encoded_methods(methods),
            objects: artifact
                .encoded
                .objects
                .entries()
                .iter()
                .map(ToString::to_string)
                .collect(),
            failures: artifact
                .failures
                .iter()
                .map(|(method, reason)| (methods.describe(*method), reason.clone()))
                .collect(),
            counters,
            phases: artifact.phases.phases().to_vec(),
        }
    }
}

/// Effective configuration: the file or the environment, then the flags.
pub fn resolve_config(args: &BuildArgs) -> Result<BuildConfig> {
    let mut config = match &args.config {
        Some(path) => BuildConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => BuildConfig::from_env(),
    };
    if !args.max_methods.is_empty() {
        config.max_methods = parse_max_methods(&args.max_methods)?;
    }
    config.enforce_max_methods |= args.enforce_max_methods;
    config.print_call_tree |= args.print_call_tree;
    config.print_candidates |= args.print_candidates;
    config.print_methods |= args.print_methods;
    config.verify_encoding |= args.verify_encoding;
    Ok(config)
}

fn output_base(args: &BuildArgs) -> PathBuf {
    args.output
        .clone()
        .unwrap_or_else(|| args.program.with_extension(""))
}

/// Run a build and write `<base>.bin` and `<base>.json`. Returns the paths written.
pub fn run_build(args: &BuildArgs) -> Result<(PathBuf, PathBuf)> {
    let config = resolve_config(args)?;
    let text = fs::read_to_string(&args.program)
        .with_context(|| format!("failed to read {}", args.program.display()))?;
    let program = ProgramScript::from_json(&text)?;
    let loaded = program.load()?;

    let profiler = BuildProfiler::new();
    let ctx = BuildContext::new(
        &config,
        &loaded.methods,
        &loaded.front_end,
        &loaded.oracle,
        &profiler,
    );
    let artifact = build(&ctx, &loaded.roots)?;

    let diagnostics = &artifact.diagnostics;
    for dump in [
        &diagnostics.call_tree,
        &diagnostics.candidates,
        &diagnostics.methods,
    ]
    .into_iter()
    .flatten()
    {
        print!("{dump}");
    }

    let base = output_base(args);
    let bin = append_extension(&base, "bin");
    let json = append_extension(&base, "json");
    if let Some(dir) = bin.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    fs::write(&bin, &artifact.encoded.encoding)
        .with_context(|| format!("failed to write {}", bin.display()))?;
    let manifest = Manifest::new(&artifact, &loaded.methods, profiler.counters());
    fs::write(&json, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("failed to write {}", json.display()))?;

    debug!("build phases\n{}", artifact.phases.render());
    info!(
        deferred = artifact.offsets.len(),
        failures = artifact.failures.len(),
        bytes = artifact.encoded.encoding.len(),
        output = %bin.display(),
        "wrote deferred graphs"
    );
    Ok((bin, json))
}

fn append_extension(base: &Path, extension: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM: &str = r#"{
        "methods": [
            { "owner": "app.Main", "name": "main",
              "ops": [ { "op": "param", "index": 0 },
                       { "op": "const", "value": { "str": "literal" } },
                       { "op": "call", "target": "app.Base.f", "virtual": true, "args": 2, "receiver": true },
                       { "op": "return" } ] },
            { "owner": "app.Base", "name": "f", "has_body": false },
            { "owner": "app.A", "name": "f",
              "ops": [ { "op": "const", "value": { "str": "literal" } }, { "op": "return" } ] },
            { "owner": "app.B", "name": "f", "fail": "unsupported bytecode" }
        ],
        "roots": ["app.Main.main"],
        "implementations": { "app.Base.f": ["app.A.f", "app.B.f"] }
    }"#;

    fn args(program: PathBuf, output: Option<PathBuf>) -> BuildArgs {
        BuildArgs {
            program,
            output,
            config: None,
            max_methods: Vec::new(),
            enforce_max_methods: false,
            print_call_tree: false,
            print_candidates: false,
            print_methods: false,
            verify_encoding: true,
        }
    }

    #[test]
    fn build_writes_buffer_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("app.json");
        fs::write(&program, PROGRAM).unwrap();

        let (bin, json) = run_build(&args(program, Some(dir.path().join("out/app")))).unwrap();

        let encoding = fs::read(&bin).unwrap();
        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&json).unwrap()).unwrap();
        let methods = manifest["methods"].as_array().unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0]["method"], "app.A.f(())");
        let bytes: u64 = methods.iter().map(|m| m["bytes"].as_u64().unwrap()).sum();
        assert_eq!(bytes as usize, encoding.len());
        assert_eq!(manifest["failures"]["app.B.f(())"], "generic failure");
        assert!(
            manifest["objects"]
                .as_array()
                .unwrap()
                .iter()
                .any(|object| object.as_str().is_some_and(|s| s.contains("literal")))
        );
        assert_eq!(manifest["counters"]["failures"], 1);
        let phases: Vec<&str> = manifest["phases"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|timing| timing["phase"].as_str())
            .collect();
        assert_eq!(phases, ["call-tree", "deopt-entries", "prune", "deopt-targets", "encode"]);
    }

    #[test]
    fn flags_override_the_budget() {
        let mut build_args = args(PathBuf::from("app.json"), None);
        build_args.max_methods = vec!["100 # base".to_string(), "20".to_string()];
        build_args.enforce_max_methods = true;

        let config = resolve_config(&build_args).unwrap();

        assert_eq!(config.max_methods, 120);
        assert!(config.enforce_max_methods);
        assert_eq!(output_base(&build_args), PathBuf::from("app"));
    }

    #[test]
    fn malformed_budget_is_rejected() {
        let mut build_args = args(PathBuf::from("app.json"), None);
        build_args.max_methods = vec!["lots".to_string()];

        let err = resolve_config(&build_args).unwrap_err();
        assert!(err.to_string().contains("'lots' is not a valid number"));
    }
}
