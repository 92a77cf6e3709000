use std::net::SocketAddr;
use verge::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "verge.yaml".to_owned());
    let text = std::fs::read_to_string(&path)
        .map_err(|err| Error::Config(format!("cannot read {path}: {err}")))?;
    let document = config::load_str(&text)?;

    // Handler file paths resolve relative to the document's directory.
    let root = Path::new(&path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let env = mount::Env::new(root);
    let router = config::build(&document, &env)?;

    let listen: SocketAddr = document
        .listen
        .as_deref()
        .unwrap_or("0.0.0.0:8080")
        .parse()
        .map_err(|err| Error::Config(format!("bad listen address: {err}")))?;

    let handle = RunConfig::new(router).bind(listen).execute().await?;
    handle.wait().await;
    Ok(())
}
