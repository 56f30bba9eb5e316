mod crd;

use kube::CustomResourceExt;

fn main() {
    println!("Generating CRDs");
    let crds = [
        ("manifests/release.yaml", serde_yaml::to_string(&crd::Release::crd())),
        (
            "manifests/providerconfig.yaml",
            serde_yaml::to_string(&crd::ProviderConfig::crd()),
        ),
        (
            "manifests/providerconfigusage.yaml",
            serde_yaml::to_string(&crd::ProviderConfigUsage::crd()),
        ),
    ];
    std::fs::create_dir_all("manifests").expect("Failed to create manifests directory");
    for (path, data) in crds {
        let data = data.expect("Could not generate yaml from CRD definition");
        std::fs::write(path, data).expect("Failed to write crd yaml to manifests");
    }
}
