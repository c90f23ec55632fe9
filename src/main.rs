use std::{env, fs::File, io::BufReader, process};

use anyhow::{Context, Result};
use layer_graph::{Net, NetSpec};
use log::info;

const DEFAULT_ITERATIONS: usize = 1;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <net.json> [iterations]", args[0]);
        process::exit(1);
    }

    let path = &args[1];
    let iterations = match args.get(2) {
        Some(n) => n
            .parse()
            .with_context(|| format!("invalid iteration count {n}"))?,
        None => DEFAULT_ITERATIONS,
    };

    let file = File::open(path).with_context(|| format!("failed to open {path}"))?;
    let spec = NetSpec::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse {path}"))?;
    let mut net = Net::new(spec).context("failed to build the network")?;

    for iteration in 0..iterations {
        let loss = net.forward()?;
        net.backward()?;
        info!(iteration; "loss {loss}");
    }

    for blob in net.output_blobs() {
        let blob = blob.borrow();
        info!("output {} shaped {}", blob.name(), blob.shape_string());
    }

    Ok(())
}
