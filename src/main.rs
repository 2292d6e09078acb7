use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match aquascore_crawler::app::run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("aquascore-crawler: {err}");
            ExitCode::FAILURE
        }
    }
}
