use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

use ssmprov::protocol::{DEFAULT_PORT, NULL};
use ssmprov::RequestShape;

/// Sends stdin to a running ssmprov as one request and prints the reply.
#[derive(Parser)]
#[command(name = "pipe")]
#[command(about = "Shape stdin into a runner request and print the reply", long_about = None)]
struct Args {
    /// Role header for the input turn
    #[arg(long = "in", value_name = "ROLE")]
    in_role: Option<String>,

    /// Role header the model answers as (needs --in)
    #[arg(long = "out", value_name = "ROLE")]
    out_role: Option<String>,

    /// Bang-line sent ahead of the body, e.g. '!live - live'
    #[arg(long, value_name = "TEXT")]
    bang: Option<String>,

    /// Keep the bang-line out of the transcript
    #[arg(long)]
    debang: bool,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value = ".transcript.txt")]
    transcript: PathBuf,

    /// Seconds to wait for the runner to accept
    #[arg(long, default_value = "5")]
    connect_timeout: u64,

    /// Seconds to wait for the reply; 0 waits forever
    #[arg(long, default_value = "600")]
    recv_timeout: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read stdin")?;
    if input.ends_with('\n') {
        input.pop();
    }
    if input.is_empty() {
        return Ok(());
    }
    if input.as_bytes().contains(&NULL) {
        bail!("input contains a NUL byte, which the wire format cannot carry");
    }

    let shape = RequestShape {
        in_role: args.in_role.clone(),
        out_role: args.out_role.clone(),
        bang: args.bang.clone(),
        debang: args.debang,
    };
    let shaped = shape.shape(&input)?;

    let reply = roundtrip(&args, shaped.wire.as_bytes())?;
    std::io::stdout().write_all(&reply)?;
    std::io::stdout().flush()?;

    if !shaped.is_command {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&args.transcript)
            .with_context(|| format!("failed to open transcript {}", args.transcript.display()))?;
        file.write_all(shaped.transcript.as_bytes())?;
        file.write_all(&reply)?;
    }

    Ok(())
}

fn roundtrip(args: &Args, request: &[u8]) -> Result<Vec<u8>> {
    let addr = (args.host.as_str(), args.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("could not resolve {}:{}", args.host, args.port))?;

    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(args.connect_timeout.max(1)))
        .with_context(|| format!("failed to connect to runner at {}", addr))?;
    if args.recv_timeout > 0 {
        stream.set_read_timeout(Some(Duration::from_secs(args.recv_timeout)))?;
    }

    stream.write_all(request)?;
    stream.write_all(&[NULL])?;
    stream.flush()?;

    let mut reply = Vec::new();
    BufReader::new(stream)
        .read_until(NULL, &mut reply)
        .context("failed to read reply")?;
    if reply.last() != Some(&NULL) {
        bail!("runner closed the connection without a complete reply");
    }
    reply.pop();
    Ok(reply)
}
