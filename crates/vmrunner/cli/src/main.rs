use vmrunner::output;

#[tokio::main]
async fn main() {
    if let Err(e) = vmrunner::run().await {
        let message = e.to_string();
        output::print_error(&message);
        println!("{}", output::error_annotation(&message));
        std::process::exit(1);
    }
}
