use kube::CustomResourceExt;
use kokeilu::crd::analysis::{AnalysisTemplate, ClusterAnalysisTemplate};
use kokeilu::crd::experiment::Experiment;

fn main() -> anyhow::Result<()> {
    // Print every CRD the controller needs as one JSON list
    // Use: cargo run --bin gen-crd | python3 -c "import sys,json,yaml; print(yaml.dump(json.load(sys.stdin), default_flow_style=False))"
    // to convert to YAML
    let crds = serde_json::json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            Experiment::crd(),
            AnalysisTemplate::crd(),
            ClusterAnalysisTemplate::crd(),
        ],
    });

    let json_output = serde_json::to_string_pretty(&crds)?;
    println!("{}", json_output);
    Ok(())
}
