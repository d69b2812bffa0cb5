use colored::Colorize;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Root};
use std::error::Error;
use std::process::ExitCode;
use vpc_topology::config::Config;
use vpc_topology::ipam::{FileIpamClient, IpamClient};
use vpc_topology::output::print_report;

fn init_logging() -> Result<(), Box<dyn Error>> {
    if log4rs::init_file("log4rs.yml", Default::default()).is_ok() {
        return Ok(());
    }
    let stderr = ConsoleAppender::builder().target(Target::Stderr).build();
    let config = log4rs::Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(
            Root::builder()
                .appender("stderr")
                .build(log::LevelFilter::Info),
        )?;
    log4rs::init_config(config)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    // Do as little as possible in main.rs as it can't contain any tests
    dotenv::dotenv().ok();
    init_logging()?;
    log::info!("#Start main()");

    let config = Config::from_env()?;
    let tree = FileIpamClient::new(&config.ipam_file).load_tree().await?;
    print_report(&tree);

    match tree.verify_tiling() {
        Ok(()) => {
            println!("#{}# container tree is consistent", "OK".on_green());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            log::error!("Tiling check failed: {e}");
            println!("#{}# {e}", "ERROR".on_red());
            Ok(ExitCode::FAILURE)
        }
    }
}
