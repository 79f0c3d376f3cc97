use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "chronicle-server", about = "Local chronicle server: dice pool and lore annotation")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "CHRONICLE_ADDR", default_value = "127.0.0.1:39340")]
    addr: SocketAddr,

    /// SQLite database path (defaults to ~/.chronicle/chronicle.db).
    #[arg(long, env = "CHRONICLE_DB")]
    db: Option<PathBuf>,

    /// YAML list of glossary entries to upsert before serving.
    #[arg(long)]
    seed_glossary: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "chronicle_server=info,chronicle_engine=info,tower_http=info".into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let db_path = args.db.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chronicle")
            .join("chronicle.db")
    });

    if let Some(seed) = &args.seed_glossary {
        let yaml = std::fs::read_to_string(seed)?;
        let engine = chronicle_engine::Engine::new(&db_path);
        let n = chronicle_server::seed_glossary(&engine, &yaml)?;
        tracing::info!(path = %seed.display(), saved = n, "seeded glossary");
    }

    tracing::info!(db = %db_path.display(), "starting chronicle server on http://{}", args.addr);
    chronicle_server::serve(args.addr, db_path).await
}
