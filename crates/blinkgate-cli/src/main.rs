use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

mod setup;

#[zbus::proxy(
    interface = "org.blinkgate.CheckIn1",
    default_service = "org.blinkgate.CheckIn1",
    default_path = "/org/blinkgate/CheckIn1"
)]
trait CheckIn {
    fn enroll(&self, user: &str, image_path: &str, label: &str, append: bool) -> zbus::Result<String>;
    fn check_in(&self, user: &str, frames_dir: &str, fps: f64) -> zbus::Result<String>;
    fn cancel_check_in(&self, user: &str) -> zbus::Result<bool>;
    fn history(&self, user: &str, limit: u32) -> zbus::Result<String>;
    fn list_models(&self, user: &str) -> zbus::Result<String>;
    fn remove_enrollment(&self, user: &str) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "blinkgate", about = "blinkgate attendance check-in CLI")]
struct Cli {
    /// Talk to a daemon on the session bus (development mode)
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and verify the pinned ONNX models
    Setup {
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Verify model files against their pinned checksums
    VerifyModels {
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Enroll a reference photo for a user
    Enroll {
        user: String,
        /// Photo showing exactly one frontal face with open eyes
        image: String,
        #[arg(short, long, default_value = "default")]
        label: String,
        /// Keep existing references instead of replacing them
        #[arg(long)]
        append: bool,
    },
    /// Check in from a directory of recorded frames
    CheckIn {
        user: String,
        frames_dir: String,
        #[arg(long, default_value_t = 30.0)]
        fps: f64,
    },
    /// Cancel a running check-in
    Cancel { user: String },
    /// Show attendance history
    History {
        user: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
    /// List enrolled references
    List { user: String },
    /// Remove every reference for a user
    Remove { user: String },
    /// Show daemon status
    Status,
}

async fn connect(session: bool) -> Result<CheckInProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    CheckInProxy::new(&conn)
        .await
        .context("blinkgated is not reachable")
}

/// Absolute form of a user-supplied path; the daemon resolves relative paths
/// against its own working directory.
fn absolute(path: &str) -> Result<String> {
    let path = std::path::Path::new(path);
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot resolve working directory")?
            .join(path)
    };
    Ok(abs.to_string_lossy().into_owned())
}

fn format_outcome(outcome: &Value) -> String {
    let verdict = if outcome["overall_accepted"].as_bool() == Some(true) {
        "ACCEPTED"
    } else {
        "REJECTED"
    };
    let score = outcome["score"]
        .as_f64()
        .map(|s| format!("{s:.3}"))
        .unwrap_or_else(|| "-".to_string());
    let mut text = format!(
        "{verdict}  user={}  blinks={}/{}  score={score} (threshold {:.2})",
        outcome["user_id"].as_str().unwrap_or("?"),
        outcome["blink_count"],
        outcome["required_blinks"],
        outcome["threshold"].as_f64().unwrap_or(0.0),
    );
    if let Some(reasons) = outcome["reasons"].as_array().filter(|r| !r.is_empty()) {
        let list: Vec<&str> = reasons.iter().filter_map(Value::as_str).collect();
        text.push_str(&format!("\n  reasons: {}", list.join(", ")));
    }
    text
}

fn format_history(history: &Value) -> String {
    let mut text = format!(
        "{}: {} check-in(s), {} accepted",
        history["user"].as_str().unwrap_or("?"),
        history["total"],
        history["successful"],
    );
    for record in history["records"].as_array().into_iter().flatten() {
        let mark = if record["overall_accepted"].as_bool() == Some(true) {
            "ok  "
        } else {
            "fail"
        };
        text.push_str(&format!(
            "\n  {mark} {}  method={}",
            record["checked_in_at"].as_str().unwrap_or("?"),
            record["method"].as_str().unwrap_or("?"),
        ));
        if let Some(reasons) = record["reasons"].as_array().filter(|r| !r.is_empty()) {
            let list: Vec<&str> = reasons.iter().filter_map(Value::as_str).collect();
            text.push_str(&format!("  ({})", list.join(", ")));
        }
    }
    text
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Setup { model_dir } => setup::run(model_dir)?,
        Commands::VerifyModels { model_dir } => {
            let dir = model_dir
                .map(std::path::PathBuf::from)
                .unwrap_or_else(setup::default_model_dir);
            blinkgate_models::verify_models_dir(&dir)?;
            println!("All pinned models in {} verified.", dir.display());
        }
        Commands::Enroll {
            user,
            image,
            label,
            append,
        } => {
            let proxy = connect(cli.session).await?;
            let id = proxy.enroll(&user, &absolute(&image)?, &label, append).await?;
            println!("Enrolled {user} ({label}): {id}");
        }
        Commands::CheckIn {
            user,
            frames_dir,
            fps,
        } => {
            let proxy = connect(cli.session).await?;
            tracing::debug!(user, frames_dir, fps, "calling CheckIn");
            let json = proxy.check_in(&user, &absolute(&frames_dir)?, fps).await?;
            let outcome: Value = serde_json::from_str(&json).context("malformed outcome")?;
            println!("{}", format_outcome(&outcome));
            if outcome["overall_accepted"].as_bool() != Some(true) {
                bail!("check-in rejected");
            }
        }
        Commands::Cancel { user } => {
            let proxy = connect(cli.session).await?;
            if proxy.cancel_check_in(&user).await? {
                println!("Cancellation requested for {user}");
            } else {
                println!("No check-in running for {user}");
            }
        }
        Commands::History { user, limit } => {
            let proxy = connect(cli.session).await?;
            let json = proxy.history(&user, limit).await?;
            let history: Value = serde_json::from_str(&json).context("malformed history")?;
            println!("{}", format_history(&history));
        }
        Commands::List { user } => {
            let proxy = connect(cli.session).await?;
            let json = proxy.list_models(&user).await?;
            let models: Value = serde_json::from_str(&json).context("malformed model list")?;
            match models.as_array() {
                Some(list) if !list.is_empty() => {
                    for m in list {
                        println!(
                            "{}  {}  {}  quality={:.2}  {}",
                            m["id"].as_str().unwrap_or("?"),
                            m["label"].as_str().unwrap_or("?"),
                            m["model_version"].as_str().unwrap_or("?"),
                            m["quality_score"].as_f64().unwrap_or(0.0),
                            m["created_at"].as_str().unwrap_or("?"),
                        );
                    }
                }
                _ => println!("No references enrolled for {user}"),
            }
        }
        Commands::Remove { user } => {
            let proxy = connect(cli.session).await?;
            if proxy.remove_enrollment(&user).await? {
                println!("Removed enrollment for {user}");
            } else {
                println!("{user} was not enrolled");
            }
        }
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            let json = proxy.status().await?;
            let status: Value = serde_json::from_str(&json).context("malformed status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_in() {
        let cli = Cli::parse_from(["blinkgate", "--session", "check-in", "alice", "/tmp/clip", "--fps", "15"]);
        assert!(cli.session);
        match cli.command {
            Commands::CheckIn { user, frames_dir, fps } => {
                assert_eq!(user, "alice");
                assert_eq!(frames_dir, "/tmp/clip");
                assert_eq!(fps, 15.0);
            }
            _ => panic!("expected check-in"),
        }
    }

    #[test]
    fn test_format_outcome_lists_reasons() {
        let outcome = serde_json::json!({
            "user_id": "alice",
            "overall_accepted": false,
            "score": 0.41,
            "threshold": 0.6,
            "blink_count": 1,
            "required_blinks": 2,
            "reasons": ["insufficient_blinks", "low_similarity_score"],
        });
        let text = format_outcome(&outcome);
        assert!(text.starts_with("REJECTED  user=alice  blinks=1/2  score=0.410"));
        assert!(text.contains("reasons: insufficient_blinks, low_similarity_score"));
    }

    #[test]
    fn test_format_outcome_without_score() {
        let outcome = serde_json::json!({
            "user_id": "bob",
            "overall_accepted": false,
            "score": null,
            "threshold": 0.6,
            "blink_count": 0,
            "required_blinks": 2,
            "reasons": ["cancelled"],
        });
        assert!(format_outcome(&outcome).contains("score=-"));
    }

    #[test]
    fn test_format_history() {
        let history = serde_json::json!({
            "user": "alice",
            "total": 2,
            "successful": 1,
            "records": [
                {"overall_accepted": true, "checked_in_at": "2026-03-02T08:00:00+00:00", "method": "both", "reasons": []},
                {"overall_accepted": false, "checked_in_at": "2026-03-01T08:00:00+00:00", "method": "face", "reasons": ["insufficient_blinks"]},
            ],
        });
        let text = format_history(&history);
        assert!(text.starts_with("alice: 2 check-in(s), 1 accepted"));
        assert!(text.contains("ok   2026-03-02T08:00:00+00:00  method=both"));
        assert!(text.contains("fail 2026-03-01T08:00:00+00:00  method=face  (insufficient_blinks)"));
    }
}
