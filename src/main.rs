use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use localbucket::config::DEFAULT_CONFIG_FILE;
use localbucket::protocol::constants::DEFAULT_READ_CHUNK;
use localbucket::{BodyEvent, Client, ClientConfig, Headers, Request, RequestEvent, Response};

#[derive(Parser)]
#[command(name = "localbucket")]
#[command(about = "Local object-storage bucket operations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, help = "Config file path (TOML, or a JSON credentials file)")]
    config: Option<String>,

    #[arg(long, help = "Bucket name (overrides config)")]
    bucket: Option<String>,

    #[arg(long, help = "Storage root directory (overrides config)")]
    prefix: Option<PathBuf>,

    #[arg(long, help = "Output as JSON")]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload FILE (or stdin) under KEY
    Put {
        key: String,
        file: Option<PathBuf>,
        #[arg(long)]
        content_type: Option<String>,
        #[arg(short = 'H', long = "header", help = "Extra header as NAME:VALUE")]
        headers: Vec<String>,
    },
    /// Download KEY to stdout or a file
    Get {
        key: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the stored headers of KEY
    Head { key: String },
    /// Delete KEY
    Del { key: String },
    /// Run an upload, stat, download and remove cycle against the bucket
    Selftest,
    GenerateConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE, help = "Config file path")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("localbucket=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::load_or_default(cli.config.as_deref())?;
    if let Some(bucket) = cli.bucket {
        config.bucket = bucket;
    }
    if let Some(prefix) = cli.prefix {
        config.prefix = prefix;
    }

    if let Commands::GenerateConfig { output } = &cli.command {
        config.save(output)?;
        if cli.json {
            println!("{}", json!({"success": true, "config_file": output}));
        } else {
            println!("Configuration saved to: {}", output);
        }
        return Ok(());
    }

    let client = Client::new(&config)?;

    match cli.command {
        Commands::Put {
            key,
            file,
            content_type,
            headers,
        } => {
            let mut all = parse_headers(&headers)?;
            if let Some(content_type) = content_type {
                all.insert("content-type".to_string(), content_type);
            }
            let source: Box<dyn AsyncRead + Unpin + Send> = match &file {
                Some(path) => Box::new(
                    tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("opening {:?}", path))?,
                ),
                None => Box::new(tokio::io::stdin()),
            };
            let resp = upload(&client, &key, all, source).await?;
            conclude(resp, BodyTarget::Discard, cli.json).await
        }
        Commands::Get { key, output } => {
            let resp = client.get(&key).response().await?;
            let target = match output {
                Some(path) => BodyTarget::File(path),
                None => BodyTarget::Stdout,
            };
            conclude(resp, target, cli.json).await
        }
        Commands::Head { key } => {
            let resp = client.head(&key).response().await?;
            conclude(resp, BodyTarget::Discard, cli.json).await
        }
        Commands::Del { key } => {
            let resp = client.del(&key).response().await?;
            conclude(resp, BodyTarget::Discard, cli.json).await
        }
        Commands::Selftest => selftest(&client, cli.json).await,
        Commands::GenerateConfig { .. } => Ok(()),
    }
}

fn parse_headers(raw: &[String]) -> Result<Headers> {
    let mut headers = Headers::new();
    for entry in raw {
        let (name, value) = entry
            .split_once(':')
            .with_context(|| format!("header {:?} is not NAME:VALUE", entry))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok(headers)
}

/// Streams `source` as the body of a PUT, gated on `Continue`.
async fn upload<R>(client: &Client, key: &str, headers: Headers, mut source: R) -> Result<Response>
where
    R: AsyncRead + Unpin,
{
    let mut req = client.put(key, headers);
    match req.next_event().await {
        Some(RequestEvent::Continue) => {}
        Some(RequestEvent::Response(resp)) => return Ok(resp),
        Some(RequestEvent::Error(e)) => return Err(e.into()),
        None => bail!("request for '{}' closed without a response", key),
    }

    let mut buf = vec![0u8; DEFAULT_READ_CHUNK];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Err(e) = req.write(Bytes::copy_from_slice(&buf[..n])).await {
            warn!("Upload interrupted: {}", e);
            break;
        }
    }
    if req.is_writable() {
        req.end().await?;
    }
    Ok(req.response().await?)
}

enum BodyTarget {
    Discard,
    Stdout,
    File(PathBuf),
}

/// Prints the response and its body; a non-2xx status becomes an error.
async fn conclude(mut resp: Response, target: BodyTarget, json: bool) -> Result<()> {
    let status = resp.status_code;
    let to_stderr = matches!(target, BodyTarget::Stdout);

    let (bytes, error_body) = if !resp.is_success() {
        let body = resp.read_body().await?;
        (body.len() as u64, Some(String::from_utf8_lossy(&body).into_owned()))
    } else {
        let n = match &target {
            BodyTarget::Discard => resp.read_body().await?.len() as u64,
            BodyTarget::Stdout => drain_body(&mut resp, &mut tokio::io::stdout()).await?,
            BodyTarget::File(path) => {
                let mut file = tokio::fs::File::create(path)
                    .await
                    .with_context(|| format!("creating {:?}", path))?;
                drain_body(&mut resp, &mut file).await?
            }
        };
        (n, None)
    };

    let report = if json {
        json!({
            "status": status,
            "headers": resp.headers,
            "bytes": bytes,
            "error": error_body,
        })
        .to_string()
    } else {
        let mut lines = vec![format!("status code: {}", status)];
        for (name, value) in &resp.headers {
            lines.push(format!("  {}: {}", name, value));
        }
        if let BodyTarget::File(path) = &target {
            lines.push(format!("Downloaded {} bytes to {}", bytes, path.display()));
        }
        if let Some(body) = &error_body {
            lines.push(body.clone());
        }
        lines.join("\n")
    };
    if to_stderr {
        eprintln!("{}", report);
    } else {
        println!("{}", report);
    }

    if !resp.is_success() {
        bail!("request failed with status {}", status);
    }
    Ok(())
}

async fn drain_body<W>(resp: &mut Response, out: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    while let Some(event) = resp.body.next_event().await {
        match event {
            BodyEvent::Data(chunk) => {
                out.write_all(&chunk).await?;
                total += chunk.len() as u64;
            }
            BodyEvent::End => {}
            BodyEvent::Error(e) => return Err(e.into()),
            BodyEvent::Close => break,
        }
    }
    out.flush().await?;
    Ok(total)
}

async fn selftest(client: &Client, json: bool) -> Result<()> {
    const KEY: &str = "test/2.txt";
    let payload: &[u8] = b"Testing the localbucket lib.";
    let mut results = Vec::new();

    let headers = Headers::from([("content-type".to_string(), "text/plain".to_string())]);
    let put = upload(client, KEY, headers, payload).await?;
    results.push(("upload", put.status_code, put.status_code == 200));

    let head = client.head(KEY).response().await?;
    let length_ok = head.header("content-length") == Some(payload.len().to_string().as_str());
    results.push(("stat", head.status_code, head.status_code == 200 && length_ok));

    let mut get = client.get(KEY).response().await?;
    let body = get.read_body().await?;
    results.push(("download", get.status_code, get.status_code == 200 && body.as_ref() == payload));

    let del = client.del(KEY).response().await?;
    results.push(("remove", del.status_code, del.status_code == 204));

    let gone = expect_status(client.get(KEY)).await?;
    results.push(("download after remove", gone, gone == 404));

    let passed = results.iter().all(|(_, _, ok)| *ok);
    if json {
        let steps: Vec<_> = results
            .iter()
            .map(|(step, status, ok)| json!({"step": step, "status": status, "ok": ok}))
            .collect();
        println!("{}", json!({"passed": passed, "steps": steps}));
    } else {
        for (step, status, ok) in &results {
            println!("{:<22} status code: {} {}", step, status, if *ok { "ok" } else { "FAILED" });
        }
    }

    info!("Selftest finished in {}", client.bucket_path().display());
    if !passed {
        bail!("selftest failed");
    }
    Ok(())
}

async fn expect_status(mut req: Request) -> Result<u16> {
    let mut resp = req.response().await?;
    resp.read_body().await?;
    Ok(resp.status_code)
}
