use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use presence_core::{confidence, Descriptor, EuclideanMatcher, MatchOutcome, Matcher, Subject, UserType};
use presence_engine::Config;
use presence_hw::{V4lBackend, VideoBackend};
use presence_store::DescriptorStore;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "presence", about = "Presence face attendance CLI")]
struct Cli {
    /// Descriptor database (overrides config and PRESENCE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled subjects, or one subject's descriptors
    List {
        #[arg(long, requires = "user_type")]
        user: Option<String>,
        #[arg(long = "type", requires = "user")]
        user_type: Option<UserType>,
    },
    /// Store a descriptor read from a JSON float array
    Import {
        #[arg(long)]
        user: String,
        #[arg(long = "type")]
        user_type: UserType,
        #[arg(long)]
        descriptor: PathBuf,
    },
    /// Match a descriptor read from a JSON float array
    Identify {
        #[arg(long)]
        descriptor: PathBuf,
    },
    /// Remove every descriptor enrolled for a subject
    Remove {
        #[arg(long)]
        user: String,
        #[arg(long = "type")]
        user_type: UserType,
    },
    /// List video input devices
    Devices,
    /// Print the effective configuration
    Config,
}

fn read_descriptor(path: &Path) -> Result<Descriptor> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_descriptor(&text).with_context(|| format!("invalid descriptor in {}", path.display()))
}

fn parse_descriptor(text: &str) -> Result<Descriptor> {
    let descriptor: Descriptor = serde_json::from_str(text)?;
    if descriptor.is_empty() {
        bail!("descriptor is empty");
    }
    if descriptor.values.iter().any(|v| !v.is_finite()) {
        bail!("descriptor contains non-finite values");
    }
    Ok(descriptor)
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn identify(store: &DescriptorStore, descriptor: &Descriptor, threshold: f32) -> Result<serde_json::Value> {
    let gallery = store.get_all().await?;
    let value = match EuclideanMatcher.compare(descriptor, &gallery, threshold) {
        MatchOutcome::NoCandidates => json!({ "matched": false, "distance": null }),
        MatchOutcome::Rejected { distance } => json!({ "matched": false, "distance": distance }),
        MatchOutcome::Matched(m) => json!({
            "matched": true,
            "subject": m.subject,
            "descriptor_id": m.descriptor_id,
            "distance": m.distance,
            "confidence": confidence(m.distance, threshold),
        }),
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    let store = DescriptorStore::open(&config.db_path);

    match cli.command {
        Commands::List { user, user_type } => match (user, user_type) {
            (Some(user), Some(user_type)) => {
                let subject = Subject::new(user, user_type);
                let records = store.get_all_for_user(&subject).await?;
                let rows: Vec<_> = records
                    .iter()
                    .map(|r| {
                        json!({
                            "id": r.id,
                            "dimensions": r.descriptor.len(),
                            "enrolled_at": format_timestamp(r.timestamp),
                        })
                    })
                    .collect();
                print_json(&json!({ "subject": subject, "descriptors": rows }))?;
            }
            _ => {
                let subjects = store.subjects().await?;
                let rows: Vec<_> = subjects
                    .into_iter()
                    .map(|(subject, count)| {
                        json!({
                            "user_id": subject.user_id,
                            "user_type": subject.user_type,
                            "descriptors": count,
                        })
                    })
                    .collect();
                print_json(&json!(rows))?;
            }
        },
        Commands::Import {
            user,
            user_type,
            descriptor,
        } => {
            let descriptor = read_descriptor(&descriptor)?;
            let record = store.add(&Subject::new(user, user_type), &descriptor).await?;
            tracing::info!(id = %record.id, "descriptor imported");
            print_json(&json!({ "id": record.id, "timestamp": record.timestamp }))?;
        }
        Commands::Identify { descriptor } => {
            let descriptor = read_descriptor(&descriptor)?;
            let result = identify(&store, &descriptor, config.match_threshold).await?;
            print_json(&result)?;
        }
        Commands::Remove { user, user_type } => {
            let subject = Subject::new(user, user_type);
            let removed = store.remove_all_for_user(&subject).await?;
            print_json(&json!({ "subject": subject, "removed": removed }))?;
        }
        Commands::Devices => {
            let devices = tokio::task::spawn_blocking(|| V4lBackend.enumerate()).await??;
            if devices.is_empty() {
                eprintln!("no video input devices found");
            }
            let rows: Vec<_> = devices
                .iter()
                .map(|d| json!({ "id": d.id, "name": d.name, "driver": d.driver, "bus": d.bus }))
                .collect();
            print_json(&json!(rows))?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        let d = parse_descriptor("[0.5, -0.25, 1.0]").unwrap();
        assert_eq!(d.values, vec![0.5, -0.25, 1.0]);
        assert!(parse_descriptor("[]").is_err());
        assert!(parse_descriptor("{\"x\": 1}").is_err());
    }

    #[test]
    fn test_list_filters_need_both_fields() {
        assert!(Cli::try_parse_from(["presence", "list", "--user", "4"]).is_err());
        assert!(Cli::try_parse_from(["presence", "list", "--user", "4", "--type", "student"]).is_ok());
        assert!(Cli::try_parse_from(["presence", "remove", "--user", "4", "--type", "guest"]).is_err());
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_identify_reports_match() {
        let store = DescriptorStore::in_memory();
        let subject = Subject::new("12", UserType::Employee);
        store.add(&subject, &Descriptor::new(vec![0.0, 0.0])).await.unwrap();

        let hit = identify(&store, &Descriptor::new(vec![0.3, 0.0]), 0.6).await.unwrap();
        assert_eq!(hit["matched"], true);
        assert_eq!(hit["subject"]["user_id"], "12");
        assert_eq!(hit["subject"]["user_type"], "employee");

        let miss = identify(&store, &Descriptor::new(vec![3.0, 0.0]), 0.6).await.unwrap();
        assert_eq!(miss["matched"], false);
    }
}
