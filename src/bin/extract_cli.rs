use std::io::Read;
use std::net::SocketAddr;
use std::thread;

use anyhow::{Context, Result};
use packet_extractor::config::ExtractorConfig;
use packet_extractor::{ExtractorOptions, FrameExtractor, PacketLayout, PacketReceiver};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

const READ_CHUNK: usize = 4096;

enum Source {
    Stdin,
    File(String),
    Listen(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/extractor.yaml".to_string();
    let mut source = Source::Stdin;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: extract_cli [--conf FILE] [--input FILE | --listen ADDR]");
                return Ok(());
            }
            "--conf" | "--input" | "--listen" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: {} requires an argument", args[i]);
                    return Ok(());
                }
                let value = args[i + 1].clone();
                match args[i].as_str() {
                    "--conf" => conf_file = value,
                    "--input" => source = Source::File(value),
                    _ => source = Source::Listen(value),
                }
                i += 1;
            }
            other => tracing::warn!("[cli] ignoring unknown argument {other}"),
        }
        i += 1;
    }

    let config = ExtractorConfig::from_file(&conf_file)
        .with_context(|| format!("Cannot load config: {}", conf_file))?;
    let layout = config.build_layout()?;
    let options = config.options();

    match source {
        Source::Stdin => {
            let input = std::io::stdin();
            tokio::task::block_in_place(|| extract_reader(layout, options, input.lock(), "stdin"))
        }
        Source::File(path) => {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("Cannot open input: {}", path))?;
            tokio::task::block_in_place(|| extract_reader(layout, options, file, &path))
        }
        Source::Listen(addr) => listen(layout, options, &addr).await,
    }
}

/// Log every record until the worker stops.
fn spawn_printer(receiver: PacketReceiver, tag: String) -> Result<thread::JoinHandle<usize>> {
    let handle = thread::Builder::new()
        .name(format!("printer-{tag}"))
        .spawn(move || {
            let mut count = 0;
            for found in receiver {
                if found.is_ok() {
                    tracing::info!("[cli] {tag} {found}");
                } else {
                    tracing::warn!("[cli] {tag} {found}");
                }
                count += 1;
            }
            count
        })
        .context("Cannot spawn printer thread")?;
    Ok(handle)
}

fn extract_reader<R: Read>(
    layout: PacketLayout,
    options: ExtractorOptions,
    mut reader: R,
    tag: &str,
) -> Result<()> {
    let extractor = FrameExtractor::start(layout, options)?;
    let printer = spawn_printer(extractor.receiver(), tag.to_string())?;

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Read failed on {tag}"))?;
        if n == 0 {
            break;
        }
        extractor.feed(&buf[..n])?;
    }
    extractor.close_input();

    let count = printer
        .join()
        .map_err(|_| anyhow::anyhow!("printer thread panicked"))?;
    tracing::info!("[cli] {tag} done records={count}");
    Ok(())
}

async fn listen(layout: PacketLayout, options: ExtractorOptions, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Cannot bind {}", addr))?;
    tracing::info!("[cli] [started] listening on {addr}");

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!("[cli] accepted {peer}");
        let layout = layout.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(layout, options, stream, peer).await {
                tracing::warn!("[cli] {peer} closed with error: {e:#}");
            }
        });
    }
}

/// Each connection is its own byte stream, so it gets its own extractor.
async fn handle_connection(
    layout: PacketLayout,
    options: ExtractorOptions,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let extractor = FrameExtractor::start(layout, options)?;
    let printer = spawn_printer(extractor.receiver(), peer.to_string())?;
    let feeder = extractor.feeder();

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = buf[..n].to_vec();
        let feeder = feeder.clone();
        tokio::task::spawn_blocking(move || feeder.feed(&chunk)).await??;
    }
    extractor.close_input();

    let count = tokio::task::spawn_blocking(move || printer.join())
        .await?
        .map_err(|_| anyhow::anyhow!("printer thread panicked"))?;
    tracing::info!("[cli] {peer} disconnected records={count}");
    Ok(())
}
