use ibiop_install::crd::InstallIntent;

use kube::CustomResourceExt;

fn main() {
    // safe unwrap: we know CRD is serializable
    print!(
        "---\n{}\n",
        serde_yaml::to_string(&InstallIntent::crd()).unwrap()
    );
}
