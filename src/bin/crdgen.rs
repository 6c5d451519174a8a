use kube::CustomResourceExt;
use pghero_operator::crd::Database;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Database::crd())?);
    Ok(())
}
