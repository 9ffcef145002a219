use jvm_image_builder::builder::BuildEngine;
use jvm_image_builder::cli::Args;
use jvm_image_builder::logging::Logger;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let output = if args.quiet {
        Logger::new_quiet()
    } else {
        Logger::new(args.verbose)
    };

    let plan = match args.load_plan() {
        Ok(plan) => plan,
        Err(err) => {
            output.error(&err.to_string());
            std::process::exit(2);
        }
    };

    let engine = match BuildEngine::new(plan, output.clone()) {
        Ok(engine) => engine,
        Err(err) => {
            output.error(&err.to_string());
            std::process::exit(2);
        }
    };

    // Ctrl-C flips the build-level cancellation flag; steps drain and
    // temp files are cleaned before exit.
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    match engine.run().await {
        Ok(result) => {
            output.success(&format!("image digest: {}", result.image_digest));
        }
        Err(err) => {
            match err.failing_step() {
                Some(step) => output.error(&format!(
                    "build failed at {}: {}",
                    step,
                    err.root_cause()
                )),
                None => output.error(&format!("build failed: {}", err)),
            }
            std::process::exit(1);
        }
    }
}
