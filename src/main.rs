use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use netx::config::{load_config, NetxConfig, ResolverKind};
use netx::context::Context;
use netx::http::{empty, BufferBody, HttpTransport, RoundTrip, Tracer};
use netx::measurement::{Emitter, Measurement};
use netx::net::Dialer;
use netx::observability::{init_logging, DEFAULT_FILTER};

#[derive(Parser)]
#[command(name = "netx")]
#[command(about = "Measure resolution, dialing, TLS and HTTP", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Copy transferred bytes into measurements.
    #[arg(long)]
    capture: bool,

    /// Resolve through this DNS-over-HTTPS endpoint.
    #[arg(long, conflicts_with = "dns")]
    doh: Option<String>,

    /// Resolve over DNS wire format with this transport.
    #[arg(long, value_parser = ["udp", "tcp", "dot"], requires = "dns_server")]
    dns: Option<String>,

    /// Server host[:port] for --dns.
    #[arg(long)]
    dns_server: Option<String>,

    /// Overall deadline in milliseconds.
    #[arg(short, long, default_value_t = 30_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a hostname
    Lookup { host: String },
    /// Dial host:port, optionally send a line and read the reply
    Connect {
        address: String,
        #[arg(short, long, default_value = "tcp")]
        network: String,
        #[arg(short, long)]
        send: Option<String>,
    },
    /// Dial host:port and run a TLS handshake
    Tls {
        address: String,
        #[arg(short, long, default_value = "tcp")]
        network: String,
    },
    /// Fetch a URL over HTTP/1.1
    Get {
        url: String,
        /// Read the whole body before reporting the response.
        #[arg(long)]
        eager: bool,
    },
}

fn print_measurement(measurement: Measurement) {
    match serde_json::to_string(&measurement) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, kind = measurement.kind(), "cannot encode measurement"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(DEFAULT_FILTER);
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => NetxConfig::default(),
    };
    if cli.capture {
        config.dialer.capture_payload = true;
    }
    if let Some(url) = &cli.doh {
        config.resolver.kind = ResolverKind::Doh;
        config.resolver.url = Some(url.clone());
    }
    if let Some(kind) = cli.dns.as_deref() {
        config.resolver.kind = match kind {
            "tcp" => ResolverKind::Tcp,
            "dot" => ResolverKind::Dot,
            _ => ResolverKind::Udp,
        };
        config.resolver.address = cli.dns_server.clone();
    }
    tracing::info!(
        resolver = ?config.resolver.kind,
        capture_payload = config.dialer.capture_payload,
        "netx v0.1.0 starting"
    );

    let sink = Arc::new(print_measurement);
    let emitter = Arc::new(Emitter::new(sink).with_payload_capture(config.dialer.capture_payload));
    let resolver = netx::resolver::from_config(&config, &emitter)?;
    let dialer = Dialer::from_config(&config, emitter.clone())?.with_resolver(resolver);
    let ctx = Context::with_timeout(Duration::from_millis(cli.timeout_ms));

    match cli.command {
        Commands::Lookup { host } => {
            let addrs = dialer.lookup_host(&ctx, &host).await?;
            tracing::info!(host = %host, ?addrs, "lookup done");
        }
        Commands::Connect { address, network, send } => {
            let mut conn = dialer.dial_context(&ctx, &network, &address).await?;
            if let Some(line) = send {
                conn.write_all(line.as_bytes()).await?;
                conn.write_all(b"\r\n").await?;
                let mut buf = vec![0u8; 4096];
                let n = ctx.run(conn.read(&mut buf)).await??;
                tracing::info!(bytes = n, "reply received");
            }
            conn.shutdown().await?;
        }
        Commands::Tls { address, network } => {
            let mut conn = dialer.dial_tls(&ctx, &network, &address).await?;
            tracing::info!(
                conn_id = %conn.conn_id(),
                version = %conn.state().version,
                alpn = ?conn.alpn(),
                "tls established"
            );
            conn.shutdown().await?;
        }
        Commands::Get { url, eager } => {
            let transport = HttpTransport::from_config(&config, dialer);
            let tracer = Tracer::new(transport, emitter.clone());
            if eager || config.http.eager_body {
                fetch(&BufferBody::new(tracer), &ctx, &url).await?;
            } else {
                fetch(&tracer, &ctx, &url).await?;
            }
        }
    }

    tracing::info!(
        bytes_read = emitter.bytes_read(),
        bytes_written = emitter.bytes_written(),
        "done"
    );
    Ok(())
}

async fn fetch<C: RoundTrip>(client: &C, ctx: &Context, url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut request = http::Request::get(url).body(empty())?;
    request.extensions_mut().insert(ctx.clone());
    let response = client.round_trip(request).await?;
    let status = response.status();
    let body = ctx
        .run(response.into_body().collect())
        .await?
        .map_err(|e| e as Box<dyn std::error::Error>)?
        .to_bytes();
    tracing::info!(%status, body_bytes = body.len(), "response received");
    Ok(())
}
