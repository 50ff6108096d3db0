//! # CRD Generator
//!
//! Prints the CustomResourceDefinitions served by riff as a multi-document
//! YAML stream.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/riff.yaml
//! cargo run --bin crdgen -- --kind Deployer | kubectl apply -f -
//! ```

use clap::{Parser, ValueEnum};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::CustomResourceExt;
use riff_system::crd::{Application, Container, Deployer, Function, Gateway, Processor, Stream};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Kind {
    Function,
    Application,
    Container,
    Deployer,
    Gateway,
    Stream,
    Processor,
}

#[derive(Debug, Parser)]
#[command(name = "crdgen", about = "Generate riff CustomResourceDefinitions")]
struct Args {
    /// Only print these kinds (default: all)
    #[arg(long, value_enum)]
    kind: Vec<Kind>,
}

fn crd(kind: Kind) -> CustomResourceDefinition {
    match kind {
        Kind::Function => Function::crd(),
        Kind::Application => Application::crd(),
        Kind::Container => Container::crd(),
        Kind::Deployer => Deployer::crd(),
        Kind::Gateway => Gateway::crd(),
        Kind::Stream => Stream::crd(),
        Kind::Processor => Processor::crd(),
    }
}

fn main() {
    let args = Args::parse();
    let kinds = if args.kind.is_empty() {
        Kind::value_variants().to_vec()
    } else {
        args.kind
    };

    for kind in kinds {
        match serde_yaml::to_string(&crd(kind)) {
            Ok(yaml) => print!("---\n{yaml}"),
            Err(e) => {
                eprintln!("Failed to serialize {kind:?} CRD to YAML: {e}");
                std::process::exit(1);
            }
        }
    }
}
