use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};

use ily_server::auth::SESSION_COOKIE;
use ily_server::preview::{PreviewRenderer, Render};

const TOKEN_FILE: &str = ".ily_token";

#[derive(Parser)]
#[command(name = "ily-cli")]
#[command(about = "CLI for the iLy website builder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "http://localhost:3000")]
    url: String,

    /// Access token sent as the session cookie; falls back to `.ily_token`.
    #[arg(short, long, env = "ILY_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Save an access token for later commands.
    Login {
        #[arg(short, long)]
        token: String,
    },
    Logout,
    Me,
    /// Generate (or edit) a site and write the live preview to a file.
    Generate {
        prompt: String,
        /// Current document to edit.
        #[arg(long)]
        html: Option<PathBuf>,
        #[arg(long)]
        previous_prompt: Option<String>,
        #[arg(short, long, default_value = "auto")]
        provider: String,
        #[arg(short, long, default_value = "index.html")]
        out: PathBuf,
    },
    /// Ask the coding assistant about a document.
    Assist {
        prompt: String,
        #[arg(long)]
        html: PathBuf,
        #[arg(long)]
        feedback: Option<String>,
        #[arg(long)]
        previous_solution: Option<String>,
    },
    Feedback {
        #[arg(short, long)]
        prompt: String,
        #[arg(short, long)]
        solution: String,
        #[arg(short, long)]
        feedback: String,
    },
    Deploy {
        #[arg(long)]
        html: PathBuf,
        #[arg(short, long)]
        title: String,
        /// Existing `user/repo` to update.
        #[arg(long)]
        path: Option<String>,
    },
    Remix {
        /// `user/repo` of the space.
        slug: String,
        #[arg(short, long, default_value = "index.html")]
        out: PathBuf,
    },
    /// List the latest assistant feedback.
    RecentFeedback {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    Usage,
    Subscription,
}

fn authed(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => builder.header(reqwest::header::COOKIE, format!("{SESSION_COOKIE}={token}")),
        None => builder,
    }
}

async fn print_response(res: Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let body = res.text().await?;
    match serde_json::from_str::<Value>(&body) {
        Ok(value) => println!("{status}: {}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{status}: {body}"),
    }
    Ok(())
}

/// Decode what `pending` holds so far. Invalid sequences become U+FFFD; an
/// incomplete code point at the end stays in `pending` for the next chunk.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut start = 0;
    loop {
        match std::str::from_utf8(&pending[start..]) {
            Ok(valid) => {
                text.push_str(valid);
                start = pending.len();
                break;
            }
            Err(e) => {
                let valid_end = start + e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[start..valid_end]));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        start = valid_end + len;
                    }
                    None => {
                        start = valid_end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..start);
    text
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let token = cli
        .token
        .clone()
        .or_else(|| fs::read_to_string(TOKEN_FILE).ok().map(|t| t.trim().to_string()))
        .filter(|t| !t.is_empty());
    let token = token.as_deref();

    match cli.command {
        Commands::Login { token } => {
            fs::write(TOKEN_FILE, token)?;
            println!("Token saved to {TOKEN_FILE}");
        }
        Commands::Logout => {
            let _ = fs::remove_file(TOKEN_FILE);
            println!("Logged out (token removed).");
        }
        Commands::Me => {
            let res = authed(client.get(format!("{}/api/auth/me", cli.url)), token).send().await?;
            print_response(res).await?;
        }
        Commands::Generate { prompt, html, previous_prompt, provider, out } => {
            let html = html.map(fs::read_to_string).transpose()?;
            let res = authed(client.post(format!("{}/api/ask-ai", cli.url)), token)
                .json(&json!({
                    "prompt": prompt,
                    "html": html,
                    "previousPrompt": previous_prompt,
                    "provider": provider,
                }))
                .send()
                .await?;
            if !res.status().is_success() {
                return print_response(res).await;
            }

            let mut renderer = PreviewRenderer::default();
            let mut pending = Vec::new();
            let mut stream = res.bytes_stream();
            while let Some(chunk) = stream.next().await {
                pending.extend_from_slice(&chunk?);
                let text = take_utf8(&mut pending);
                match renderer.push(&text) {
                    Some(Render::Partial(doc)) => fs::write(&out, doc)?,
                    Some(Render::Final(doc)) => {
                        fs::write(&out, doc)?;
                        break;
                    }
                    None => {}
                }
            }

            match renderer.finish() {
                Some(doc) => {
                    fs::write(&out, doc)?;
                    println!("Preview written to {}", out.display());
                }
                None => println!("No HTML document in the answer:\n{}", renderer.raw()),
            }
        }
        Commands::Assist { prompt, html, feedback, previous_solution } => {
            let html = fs::read_to_string(html)?;
            let res = authed(client.post(format!("{}/api/ai-assistant", cli.url)), token)
                .json(&json!({
                    "prompt": prompt,
                    "html": html,
                    "feedback": feedback,
                    "previousSolution": previous_solution,
                }))
                .send()
                .await?;
            if !res.status().is_success() {
                return print_response(res).await;
            }
            let mut pending = Vec::new();
            let mut stream = res.bytes_stream();
            while let Some(chunk) = stream.next().await {
                pending.extend_from_slice(&chunk?);
                print!("{}", take_utf8(&mut pending));
            }
            println!();
        }
        Commands::Feedback { prompt, solution, feedback } => {
            let res = authed(client.post(format!("{}/api/ai-feedback", cli.url)), token)
                .json(&json!({ "prompt": prompt, "solution": solution, "feedback": feedback }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::RecentFeedback { limit } => {
            let res = authed(client.get(format!("{}/api/ai-feedback/recent", cli.url)), token)
                .query(&[("limit", limit)])
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Deploy { html, title, path } => {
            let html = fs::read_to_string(html)?;
            let res = authed(client.post(format!("{}/api/deploy", cli.url)), token)
                .json(&json!({ "html": html, "title": title, "path": path }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Remix { slug, out } => {
            let res = client.get(format!("{}/api/remix/{}", cli.url, slug)).send().await?;
            if !res.status().is_success() {
                return print_response(res).await;
            }
            let body: Value = res.json().await?;
            fs::write(&out, body["html"].as_str().unwrap_or_default())?;
            println!("Remixed {slug} into {}", out.display());
        }
        Commands::Usage => {
            let res = authed(client.get(format!("{}/api/user/usage", cli.url)), token).send().await?;
            print_response(res).await?;
        }
        Commands::Subscription => {
            let res = authed(client.get(format!("{}/api/user/subscription", cli.url)), token)
                .send()
                .await?;
            print_response(res).await?;
        }
    }

    Ok(())
}
