//! Prints the CRD manifests as a multi-document YAML stream.

use crds::{ClusterTemplate, HardwareTemplate, ProvisioningRequest};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        ProvisioningRequest::crd(),
        ClusterTemplate::crd(),
        HardwareTemplate::crd(),
    ];

    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }

    Ok(())
}
