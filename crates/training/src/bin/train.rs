use clap::Parser;
use training::pipeline::{init_tracing, run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = TrainArgs::parse();
    run_train(args)
}
