use kube::CustomResourceExt;
use pair_scheduler::crd::ClusterSizingConfiguration;

fn main() {
    match serde_yaml::to_string(&ClusterSizingConfiguration::crd()) {
        Ok(yaml) => print!("{}", yaml),
        Err(e) => {
            eprintln!("failed to render CRD: {}", e);
            std::process::exit(1);
        }
    }
}
