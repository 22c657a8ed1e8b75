//! Preview Sandbox CLI
//!
//! Single-shot mode:
//!   preview-sandbox [--config FILE] <index.html> [styles.css] [script.js]
//!   preview-sandbox [--config FILE] --generated <code-file> [title]
//!
//! Server mode (persistent process, reads from stdin):
//!   preview-sandbox [--config FILE] --server
//!
//! Protocol (server mode), one JSON request per line:
//!   {"markup":"<h1>Hi</h1>","styles":"h1{color:red}","script":"console.log('ready')"}
//!   {"document":"<!doctype html>..."}
//!   {"generated":"function App() { ... }","title":"Todo"}
//!
//!   Response (stdout), body is the console log:
//!     Status:Ok
//!     Length:11
//!
//!     [log] ready
//!
//!   Error response (the document could not be built):
//!     Status:Error
//!     Length:61
//!
//!     malformed document: no `</head>` marker to insert the ...

use anyhow::{anyhow, Context, Result};
use preview_sandbox::{HostConfig, SandboxHost, SourceFragment};
use serde::Deserialize;
use std::io::{BufRead, Write};

fn print_usage() {
    eprintln!("Preview Sandbox - run untrusted web code in an isolated surface");
    eprintln!();
    eprintln!("Single-shot mode:");
    eprintln!("  preview-sandbox [--config FILE] <index.html> [styles.css] [script.js]");
    eprintln!("  preview-sandbox [--config FILE] --generated <code-file> [title]");
    eprintln!();
    eprintln!("Server mode (persistent process):");
    eprintln!("  preview-sandbox [--config FILE] --server");
    eprintln!();
    eprintln!("Set RUST_LOG=preview_sandbox=debug for lifecycle logging.");
}

/// One run request in server mode.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunRequest {
    markup: String,
    styles: String,
    script: String,
    document: Option<String>,
    generated: Option<String>,
    title: Option<String>,
}

impl RunRequest {
    fn into_fragment(self, default_title: &str) -> SourceFragment {
        if let Some(document) = self.document {
            SourceFragment::Document(document)
        } else if let Some(code) = self.generated {
            SourceFragment::from_generated(&code, self.title.as_deref().unwrap_or(default_title))
        } else {
            SourceFragment::parts(self.markup, self.styles, self.script)
        }
    }
}

fn read_file(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read '{}'", path))
}

/// Run in single-shot mode
async fn run_single_shot(config: HostConfig, fragment: SourceFragment) -> Result<()> {
    let mut host = SandboxHost::new(config)?;
    let report = host.run(&fragment).await?;

    // Print forwarded console output to stderr
    for line in host.console().lines() {
        eprintln!("{}", line);
    }
    if let Some(reason) = report.load.halted {
        eprintln!("[preview-sandbox] preview halted: {:?}", reason);
    }

    // Print the instrumented document the surface rendered to stdout
    if let Some(document) = host.resources().resolve(&report.handle) {
        println!("{}", document);
    }

    Ok(())
}

/// Run in server mode (persistent process, reads requests from stdin)
async fn run_server(config: HostConfig) -> Result<()> {
    let default_title = config.title.clone();
    // One host for the whole session; every request replaces its surface.
    let mut host = SandboxHost::new(config)?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    tracing::info!("server ready, reading from stdin");

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            // EOF - stdin closed, exit gracefully
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: RunRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                write_response(&mut stdout, false, &format!("Invalid request JSON: {}", e))?;
                continue;
            }
        };

        match host.run(&request.into_fragment(&default_title)).await {
            Ok(_) => write_response(&mut stdout, true, &host.console().lines().join("\n"))?,
            Err(e) => write_response(&mut stdout, false, &e.to_string())?,
        }
    }

    host.teardown();
    tracing::info!("server shutting down");
    Ok(())
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args
                .get(i + 1)
                .cloned()
                .ok_or_else(|| anyhow!("--config requires a file argument"))?;
            args.drain(i..=i + 1);
            HostConfig::load(&path)?
        }
        None => HostConfig::default(),
    };

    match args.first().map(String::as_str) {
        None => {
            print_usage();
            Err(anyhow!("Missing required arguments"))
        }
        Some("--server") => run_server(config).await,
        Some("--generated") => {
            let path = args.get(1).ok_or_else(|| {
                print_usage();
                anyhow!("--generated requires a code file")
            })?;
            let code = read_file(path)?;
            let title = args.get(2).cloned().unwrap_or_else(|| config.title.clone());
            let fragment = SourceFragment::from_generated(&code, &title);
            run_single_shot(config, fragment).await
        }
        Some(_) => {
            let markup = read_file(&args[0])?;
            let styles = args.get(1).map(|p| read_file(p)).transpose()?.unwrap_or_default();
            let script = args.get(2).map(|p| read_file(p)).transpose()?.unwrap_or_default();
            run_single_shot(config, SourceFragment::parts(markup, styles, script)).await
        }
    }
}
