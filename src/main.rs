#![warn(clippy::all)]

mod common;
mod compile;
mod embed;
mod error;
mod row;
mod scaffold;
mod schedule;
mod serve;
mod session;
mod site;
mod source;
mod template;
mod watch;

mod prelude {
    pub use color_eyre::eyre::{bail, ensure, eyre, Context as EyreContext, ContextCompat};
    pub use color_eyre::{Report, Result, Section};
    pub use indoc::indoc;
    pub use tracing::{debug, error, info, warn};

    pub use crate::common::*;
}

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use prelude::*;
use site::Site;

fn main() -> ExitCode {
    install_logging();

    let args = Arguments::parse();

    match run(args) {
        Ok(code) => code,
        Err(report) => {
            error!("{report:?}");
            ExitCode::from(1)
        }
    }
}

fn run(args: Arguments) -> Result<ExitCode> {
    match &args.command {
        Command::New { dir, template } => {
            let (dir, template) = (dir.clone(), template.clone());
            scaffold::create(&dir, &template)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Validate { .. } => {
            let ctx = InnerContext::init(args)?;
            let (pages, errors) = site::compile_all(&ctx);

            for error in &errors {
                println!("{error}");
            }

            if errors.is_empty() {
                println!("{} page(s) ok.", pages.len());
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(2))
            }
        }

        Command::Build { dir, output, target } => {
            let (dir, output, target) = (dir.clone(), output.clone(), target.clone());

            match embed::build(&dir, output.as_deref(), target.as_deref()) {
                Ok(out) => {
                    println!("Standalone site written to {}.", out.display());
                    Ok(ExitCode::SUCCESS)
                }
                Err(report) => {
                    error!("{report:?}");
                    Ok(ExitCode::from(3))
                }
            }
        }

        Command::Serve { .. } => {
            // A binary produced by `build` carries the site with it; the
            // embedded copy wins over the directory argument.
            let ctx = match embed::extract_embedded()? {
                Some(root) => {
                    let config = InnerContext::load_config(&root)?;
                    Arc::new(InnerContext { args, config, root })
                }
                None => InnerContext::init(args)?,
            };

            info!("Starting Tokio runtime.");
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("Failed to start Tokio runtime.")
                .block_on(async move {
                    let site = Site::load(ctx).await?;
                    serve::serve(site).await
                })?;

            Ok(ExitCode::SUCCESS)
        }
    }
}

fn install_logging() {
    use color_eyre::config::HookBuilder;
    use tracing_error::ErrorLayer;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let fmt_layer = fmt::layer().with_target(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();

    HookBuilder::new()
        .panic_section(indoc! {
            "Well, this is embarassing. It appears Tinkerdown has crashed!
            Consider reporting the bug at \"https://github.com/tinkerdown/tinkerdown\"."
        })
        .display_env_section(false)
        .display_location_section(false)
        .install()
        .expect("Could not install Eyre hooks!");

    info!("Logging installed.")
}
