use kube::CustomResourceExt;
use release_orchestrator::crd::release::Release;

/// Print the Release CRD manifest
///
/// YAML by default; pass `--json` for JSON.
fn main() -> anyhow::Result<()> {
    let crd = Release::crd();
    let json = std::env::args().skip(1).any(|arg| arg == "--json");

    let output = if json {
        serde_json::to_string_pretty(&crd)?
    } else {
        serde_yaml::to_string(&crd)?
    };
    println!("{}", output);
    Ok(())
}
