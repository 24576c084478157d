use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config_path = std::env::var("JANUS_CONFIG_FILE").ok().map(PathBuf::from);
	janus_gate::run(config_path.as_deref()).await
}
