use clap::Parser;
use training::pipeline::{init_tracing, run_eval, EvalArgs};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = EvalArgs::parse();
    let scores = run_eval(args)?;
    println!("{}", serde_json::to_string(&scores)?);
    Ok(())
}
