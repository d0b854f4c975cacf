use std::path::{Path, PathBuf};

use anchor_core::Embedding;
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "anchor", about = "Cogni Anchor face recognition CLI")]
struct Cli {
    /// Base URL of the anchord server
    #[arg(long, env = "ANCHOR_SERVER", default_value = "http://127.0.0.1:8000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ProfileArgs {
    /// Person's name
    #[arg(long)]
    name: Option<String>,
    /// Relationship to the patient (e.g., "Son", "Friend")
    #[arg(long)]
    relationship: Option<String>,
    #[arg(long)]
    occupation: Option<String>,
    #[arg(long)]
    age: Option<u32>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a face photo
    Add {
        #[arg(long)]
        pair: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        relationship: String,
        #[arg(long)]
        occupation: String,
        #[arg(long)]
        age: Option<u32>,
        #[arg(long)]
        notes: Option<String>,
        /// Face image file
        image: PathBuf,
    },
    /// List enrolled people for a pair
    List {
        #[arg(long)]
        pair: String,
    },
    /// Match a face photo (or a JSON embedding file) against a pair
    Scan {
        #[arg(long)]
        pair: String,
        /// Face image file
        #[arg(required_unless_present = "embedding", conflicts_with = "embedding")]
        image: Option<PathBuf>,
        /// JSON file holding an embedding array
        #[arg(long)]
        embedding: Option<PathBuf>,
    },
    /// Update a person's profile and/or photo
    Update {
        id: i64,
        #[command(flatten)]
        profile: ProfileArgs,
        /// New face image
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Remove an enrolled person
    Delete { id: i64 },
    /// Show server status
    Status,
}

fn face_url(server: &str, route: &str) -> String {
    format!("{}/api/v1/face/{route}", server.trim_end_matches('/'))
}

fn text_fields(profile: ProfileArgs) -> Vec<(&'static str, String)> {
    let ProfileArgs {
        name,
        relationship,
        occupation,
        age,
        notes,
    } = profile;
    [
        ("name", name),
        ("relationship", relationship),
        ("occupation", occupation),
        ("age", age.map(|a| a.to_string())),
        ("notes", notes),
    ]
    .into_iter()
    .filter_map(|(k, v)| v.map(|v| (k, v)))
    .collect()
}

async fn image_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    Ok(Part::bytes(bytes).file_name(file_name))
}

fn load_embedding(path: &Path) -> Result<Embedding> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not an embedding array", path.display()))
}

/// Pull the server's `detail` message out of an error body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

async fn send(request: reqwest::RequestBuilder) -> Result<Value> {
    let response = request.send().await.context("anchord: not reachable")?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        bail!("{status}: {}", error_detail(&body));
    }
    serde_json::from_str(&body).context("invalid JSON from server")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let server = cli.server.as_str();

    let result = match cli.command {
        Commands::Add {
            pair,
            name,
            relationship,
            occupation,
            age,
            notes,
            image,
        } => {
            let profile = ProfileArgs {
                name: Some(name),
                relationship: Some(relationship),
                occupation: Some(occupation),
                age,
                notes,
            };
            let mut form = Form::new().text("pair_id", pair);
            for (key, value) in text_fields(profile) {
                form = form.text(key, value);
            }
            form = form.part("image", image_part(&image).await?);
            send(client.post(face_url(server, "addPerson")).multipart(form)).await?
        }
        Commands::List { pair } => {
            send(
                client
                    .get(face_url(server, "getPeople"))
                    .query(&[("pair_id", pair)]),
            )
            .await?
        }
        Commands::Scan {
            pair,
            image,
            embedding,
        } => match (image, embedding) {
            (_, Some(path)) => {
                let embedding = load_embedding(&path)?;
                tracing::debug!(dims = embedding.dimensions(), "scanning by embedding");
                send(
                    client
                        .post(face_url(server, "scan"))
                        .json(&json!({ "pair_id": pair, "embedding": embedding })),
                )
                .await?
            }
            (Some(image), None) => {
                let form = Form::new()
                    .text("pair_id", pair)
                    .part("image", image_part(&image).await?);
                send(client.post(face_url(server, "scanImage")).multipart(form)).await?
            }
            (None, None) => bail!("either an image or --embedding is required"),
        },
        Commands::Update { id, profile, image } => {
            let mut form = Form::new().text("person_id", id.to_string());
            for (key, value) in text_fields(profile) {
                form = form.text(key, value);
            }
            if let Some(image) = image {
                form = form.part("image", image_part(&image).await?);
            }
            send(client.put(face_url(server, "updatePerson")).multipart(form)).await?
        }
        Commands::Delete { id } => {
            send(
                client
                    .delete(face_url(server, "deletePerson"))
                    .query(&[("person_id", id)]),
            )
            .await?
        }
        Commands::Status => {
            send(client.get(format!("{}/health", server.trim_end_matches('/')))).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn scan_requires_image_or_embedding() {
        assert!(Cli::try_parse_from(["anchor", "scan", "--pair", "p1"]).is_err());
        assert!(Cli::try_parse_from(["anchor", "scan", "--pair", "p1", "face.jpg"]).is_ok());
        assert!(
            Cli::try_parse_from(["anchor", "scan", "--pair", "p1", "--embedding", "e.json"]).is_ok()
        );
        assert!(Cli::try_parse_from([
            "anchor", "scan", "--pair", "p1", "face.jpg", "--embedding", "e.json"
        ])
        .is_err());
    }

    #[test]
    fn only_given_profile_fields_are_sent() {
        let cli = Cli::try_parse_from(["anchor", "update", "7", "--notes", "Likes jazz", "--age", "70"])
            .unwrap();
        let Commands::Update { id, profile, image } = cli.command else {
            panic!("expected update");
        };
        assert_eq!(id, 7);
        assert!(image.is_none());
        assert_eq!(
            text_fields(profile),
            vec![("age", "70".to_string()), ("notes", "Likes jazz".to_string())]
        );
    }

    #[test]
    fn add_requires_profile_fields() {
        let base = ["anchor", "add", "--pair", "p1", "face.jpg"];
        assert!(Cli::try_parse_from(base).is_err());
        assert!(Cli::try_parse_from([
            "anchor", "add", "--pair", "p1", "--name", "Ravi", "--relationship", "Son",
            "face.jpg"
        ])
        .is_err());

        let cli = Cli::try_parse_from([
            "anchor", "add", "--pair", "p1", "--name", "Ravi", "--relationship", "Son",
            "--occupation", "Chef", "face.jpg",
        ])
        .unwrap();
        let Commands::Add { name, age, image, .. } = cli.command else {
            panic!("expected add");
        };
        assert_eq!(name, "Ravi");
        assert_eq!(age, None);
        assert_eq!(image, PathBuf::from("face.jpg"));
    }

    #[test]
    fn delete_takes_a_numeric_id() {
        assert!(Cli::try_parse_from(["anchor", "delete", "12"]).is_ok());
        assert!(Cli::try_parse_from(["anchor", "delete", "twelve"]).is_err());
    }

    #[test]
    fn face_url_joins_route() {
        assert_eq!(
            face_url("http://host:8000/", "scan"),
            "http://host:8000/api/v1/face/scan"
        );
    }

    #[test]
    fn error_detail_prefers_server_message() {
        assert_eq!(error_detail(r#"{"detail":"Person 3 not found"}"#), "Person 3 not found");
        assert_eq!(error_detail("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn embedding_file_must_be_an_array() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        std::fs::write(&good, "[0.1, 0.2, 0.3]").unwrap();
        std::fs::write(&bad, r#"{"embedding": 1}"#).unwrap();

        assert_eq!(load_embedding(&good).unwrap().dimensions(), 3);
        assert!(load_embedding(&bad).is_err());
        assert!(load_embedding(&dir.path().join("missing.json")).is_err());
    }
}
