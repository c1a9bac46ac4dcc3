use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod setup;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance verification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus (development mode).
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the detection and embedding model files
    Setup {
        /// Target model directory (defaults to the system location)
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Enroll a student's profile reference image from a file
    Enroll {
        /// Student identifier
        student_id: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Path to the profile image file
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Verify a candidate image against a student's enrolled profile
    Verify {
        /// Student identifier
        student_id: String,
        /// Path to the candidate image file
        #[arg(short, long)]
        image: PathBuf,
        /// Match policy: strict, default, or relaxed
        #[arg(short, long, default_value = "")]
        policy: String,
    },
    /// Remove a student's enrolled profile
    Remove {
        /// Student identifier
        student_id: String,
    },
    /// List enrolled profiles
    Profiles,
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn submit_verification(
        &self,
        student_id: &str,
        image: &str,
        policy: &str,
    ) -> zbus::Result<String>;
    async fn enroll_profile(
        &self,
        student_id: &str,
        display_name: &str,
        image: &str,
    ) -> zbus::Result<String>;
    async fn remove_profile(&self, student_id: &str) -> zbus::Result<bool>;
    async fn list_profiles(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

async fn connect(session: bool) -> Result<AttendanceProxy<'static>> {
    let connection = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus — is rollcalld running?")?;

    AttendanceProxy::new(&connection)
        .await
        .context("failed to create daemon proxy")
}

/// Read an image file and Base64-encode it for transport.
fn read_image_b64(path: &PathBuf) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default()),
        Err(_) => println!("{raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Setup { model_dir } => {
            setup::run(model_dir)?;
        }
        Commands::Enroll {
            student_id,
            name,
            image,
        } => {
            let proxy = connect(cli.session).await?;
            let encoded = read_image_b64(&image)?;
            let result = proxy.enroll_profile(&student_id, &name, &encoded).await?;
            print_json(&result);
        }
        Commands::Verify {
            student_id,
            image,
            policy,
        } => {
            let proxy = connect(cli.session).await?;
            let encoded = read_image_b64(&image)?;
            let result = proxy
                .submit_verification(&student_id, &encoded, &policy)
                .await?;
            print_json(&result);
        }
        Commands::Remove { student_id } => {
            let proxy = connect(cli.session).await?;
            let removed = proxy.remove_profile(&student_id).await?;
            if removed {
                println!("Profile removed: {student_id}");
            } else {
                println!("No profile found for {student_id}");
            }
        }
        Commands::Profiles => {
            let proxy = connect(cli.session).await?;
            let profiles = proxy.list_profiles().await?;
            print_json(&profiles);
        }
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            let status = proxy.status().await?;
            print_json(&status);
        }
    }

    Ok(())
}
