//! Interactive numbered-menu front-end over the skiff orchestrator and its
//! Docker/QEMU backends.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use skiff_backend::docker::{self, DockerBackend};
use skiff_backend::qemu::{QemuBackend, QemuConfig};
use skiff_common::{ContainerSpec, ResourceSpec, SkiffError, VmSpec};
use skiff_orchestrator::{Orchestrator, OrchestratorConfig};

/// How long menu actions wait for a provision to settle before handing the
/// id back to the user to check later.
const SETTLE_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, Parser)]
#[command(name = "skiff", about = "Container and VM management front-end", version)]
struct Cli {
    /// Directory for VM disk images.
    #[arg(long, default_value = "vm_storage")]
    storage_dir: PathBuf,

    /// Seconds a provision may take before it fails with a timeout.
    #[arg(long, default_value_t = 120)]
    provision_timeout: u64,

    /// Seconds a stop may take before it fails with a timeout.
    #[arg(long, default_value_t = 30)]
    stop_timeout: u64,

    /// Maximum number of concurrent backend operations.
    #[arg(long, default_value_t = 4)]
    max_concurrent: usize,

    /// Disable KVM acceleration for launched VMs.
    #[arg(long)]
    no_kvm: bool,

    /// QEMU display backend (gtk, sdl, none, ...).
    #[arg(long, default_value = "gtk")]
    display: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let docker = Arc::new(DockerBackend::connect()?);
    if let Err(e) = docker.health_check().await {
        warn!(error = %e, "docker daemon not reachable; container operations will fail until it is");
    }

    let qemu = Arc::new(QemuBackend::new(QemuConfig {
        storage_dir: cli.storage_dir.clone(),
        enable_kvm: !cli.no_kvm,
        display: cli.display.clone(),
        ..Default::default()
    }));

    let orchestrator = Orchestrator::new(
        docker.clone(),
        qemu,
        OrchestratorConfig {
            provision_timeout: Duration::from_secs(cli.provision_timeout),
            stop_timeout: Duration::from_secs(cli.stop_timeout),
            max_concurrent_ops: cli.max_concurrent,
            ..Default::default()
        },
    );

    run_menu(&docker, &orchestrator).await
}

fn print_header() {
    println!("{}", "=".repeat(40));
    println!("   skiff — container & VM management");
    println!("{}", "=".repeat(40));
}

async fn run_menu(docker: &DockerBackend, orchestrator: &Orchestrator) -> anyhow::Result<()> {
    loop {
        print_header();
        println!("1. VM operations (QEMU)");
        println!("2. Docker operations");
        println!("3. Resource registry");
        println!("0. Exit");
        println!("{}", "-".repeat(40));

        match prompt("Enter your choice: ")?.as_str() {
            "1" => vm_menu(orchestrator).await?,
            "2" => docker_menu(docker, orchestrator).await?,
            "3" => resources_menu(orchestrator).await?,
            "0" => {
                println!("Exiting. Goodbye!");
                return Ok(());
            }
            _ => println!("Invalid choice, please try again."),
        }
    }
}

/// Read one trimmed line from stdin; `None` on EOF.
fn read_line_opt(label: &str) -> io::Result<Option<String>> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Read one trimmed line from stdin. EOF behaves like choosing back/exit.
fn prompt(label: &str) -> io::Result<String> {
    Ok(read_line_opt(label)?.unwrap_or_else(|| "0".to_string()))
}

fn parse_u32(raw: &str) -> Option<u32> {
    raw.parse().ok()
}

/// Render an error by taxonomy kind rather than dumping the raw message.
fn report(err: &SkiffError) {
    match err {
        SkiffError::InvalidSpec(msg) => println!("Invalid input: {msg}"),
        SkiffError::BackendUnavailable(msg) => {
            println!("Backend unavailable: {msg}");
            println!("Is the daemon running and the binary on PATH?");
        }
        SkiffError::NotFound(what) => println!("Not found: {what}"),
        SkiffError::Timeout(bound) => println!("Timed out after {bound:?}."),
        SkiffError::Cancelled => println!("Cancelled."),
        SkiffError::BuildFailed { message, log_tail } => {
            println!("Build failed: {message}");
            for line in log_tail {
                println!("  {line}");
            }
        }
        SkiffError::InvalidState(state) => {
            println!("Resource is {state}; that operation does not apply.")
        }
        SkiffError::ResourceConflict(msg) => println!("Conflict: {msg}"),
        other => println!("Error: {other}"),
    }
}

async fn submit(orchestrator: &Orchestrator, spec: ResourceSpec) {
    match orchestrator.provision(spec).await {
        Ok(id) => {
            println!("Provisioning started: {id}");
            match orchestrator.wait_settled(&id, SETTLE_WAIT).await {
                Ok(snapshot) => {
                    let detail = snapshot
                        .detail
                        .as_deref()
                        .map(|d| format!(" — {d}"))
                        .unwrap_or_default();
                    println!("Current state: {}{}", snapshot.state, detail);
                }
                Err(e) => report(&e),
            }
        }
        Err(e) => report(&e),
    }
}

// --- VM menu ---

async fn vm_menu(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    println!("\n--- VM Operations ---");
    println!("1. Create VM (interactive)");
    println!("2. Create VM (from config file)");
    println!("0. Back to main menu");

    match prompt("Select operation: ")?.as_str() {
        "1" => create_vm_interactive(orchestrator).await?,
        "2" => create_vm_from_config(orchestrator).await?,
        "0" => {}
        _ => println!("Invalid choice."),
    }
    Ok(())
}

async fn create_vm_interactive(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    println!("\n--- Create Virtual Machine (Interactive) ---");
    let vm_name = prompt("VM name (used for the disk file): ")?;
    let ram = prompt("RAM size in MB [e.g. 512, 1024, 2048]: ")?;
    let cpu = prompt("Number of CPU cores [e.g. 1, 2]: ")?;
    let disk = prompt("Disk size in GB: ")?;

    let (Some(ram_mb), Some(cpu_cores), Some(disk_size_gb)) =
        (parse_u32(&ram), parse_u32(&cpu), parse_u32(&disk))
    else {
        println!("Please enter numbers only for RAM, CPU and disk.");
        return Ok(());
    };

    let iso = prompt("Path to an ISO installer (leave empty for none): ")?;
    let spec = VmSpec {
        vm_name,
        ram_mb,
        cpu_cores,
        disk_size_gb,
        iso_path: (!iso.is_empty()).then(|| PathBuf::from(iso)),
    };

    submit(orchestrator, ResourceSpec::Vm(spec)).await;
    Ok(())
}

async fn create_vm_from_config(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    println!("\n--- Create VM (From Config File) ---");
    let mut path = prompt("Configuration file path (default: vm_config.json): ")?;
    if path.is_empty() {
        path = "vm_config.json".to_string();
    }

    match VmSpec::from_json_file(Path::new(&path)) {
        Ok(spec) => {
            println!(
                "Loaded configuration: {} ({} MB RAM, {} cores, {} GB disk)",
                spec.vm_name, spec.ram_mb, spec.cpu_cores, spec.disk_size_gb
            );
            submit(orchestrator, ResourceSpec::Vm(spec)).await;
        }
        Err(e) => report(&e),
    }
    Ok(())
}

// --- Docker menu ---

async fn docker_menu(docker: &DockerBackend, orchestrator: &Orchestrator) -> anyhow::Result<()> {
    println!("\n--- Docker Operations ---");
    println!("1. Create Dockerfile");
    println!("2. Build image");
    println!("3. List images");
    println!("4. List running containers");
    println!("5. Stop a container");
    println!("6. Search image (Docker Hub)");
    println!("7. Pull image");
    println!("8. Search local images");
    println!("9. Run container (orchestrated)");
    println!("0. Back to main menu");

    match prompt("Select operation: ")?.as_str() {
        "1" => create_dockerfile()?,
        "2" => build_image(docker).await?,
        "3" => list_images(docker).await,
        "4" => list_containers(docker).await,
        "5" => stop_container(docker).await?,
        "6" => search_hub(docker).await?,
        "7" => pull_image(docker).await?,
        "8" => search_local_images(docker).await?,
        "9" => run_container(orchestrator).await?,
        "0" => {}
        _ => println!("Invalid choice."),
    }
    Ok(())
}

fn create_dockerfile() -> anyhow::Result<()> {
    println!("\n--- Create Dockerfile ---");
    let folder = prompt("Folder name for this project (e.g. 'my_website'): ")?;
    if folder.is_empty() {
        println!("Folder name must not be empty.");
        return Ok(());
    }

    println!("Enter Dockerfile instructions one by one.");
    println!("Type 'DONE' when you are finished. Example: FROM ubuntu");
    let mut lines = Vec::new();
    loop {
        let Some(line) = read_line_opt("Instruction: ")? else {
            break;
        };
        if line.eq_ignore_ascii_case("done") {
            break;
        }
        lines.push(line);
    }

    match docker::write_dockerfile(Path::new(&folder), &lines) {
        Ok(path) => println!("Dockerfile saved at: {}", path.display()),
        Err(e) => report(&e),
    }
    Ok(())
}

async fn build_image(docker: &DockerBackend) -> anyhow::Result<()> {
    println!("\n--- Build Docker Image ---");
    let path = prompt("Path to the folder with the Dockerfile: ")?;
    let tag = prompt("Name for the new image (e.g. 'my-custom-app:v1'): ")?;

    println!("Building image...");
    match docker
        .build(Path::new(&path), &tag, |line| println!("{line}"))
        .await
    {
        Ok(()) => println!("Success! Image '{tag}' built."),
        Err(e) => report(&e),
    }
    Ok(())
}

fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    &id[..id.len().min(12)]
}

async fn list_images(docker: &DockerBackend) {
    println!("\n--- Local Docker Images ---");
    match docker.list_images().await {
        Ok(images) => {
            if images.is_empty() {
                println!("No images found. Try pulling one first!");
            }
            for img in images {
                let tags = if img.tags.is_empty() {
                    "<no-tag>".to_string()
                } else {
                    img.tags.join(", ")
                };
                println!(
                    "ID: {} | Tags: {} | Size: {:.1} MB",
                    short_id(&img.id),
                    tags,
                    img.size_bytes as f64 / (1024.0 * 1024.0)
                );
            }
        }
        Err(e) => report(&e),
    }
}

async fn list_containers(docker: &DockerBackend) {
    println!("\n--- Running Containers ---");
    match docker.list_containers().await {
        Ok(containers) => {
            if containers.is_empty() {
                println!("No containers are currently running.");
            }
            for c in containers {
                println!(
                    "ID: {} | Name: {} | Status: {} | Image: {}",
                    short_id(&c.id),
                    c.name,
                    c.status,
                    c.image
                );
            }
        }
        Err(e) => report(&e),
    }
}

async fn stop_container(docker: &DockerBackend) -> anyhow::Result<()> {
    let target = prompt("Container ID or name to stop: ")?;
    if target.is_empty() {
        return Ok(());
    }
    println!("Stopping container {target}...");
    match docker.stop_container(&target).await {
        Ok(()) => println!("Container {target} stopped."),
        Err(e) => report(&e),
    }
    Ok(())
}

async fn search_hub(docker: &DockerBackend) -> anyhow::Result<()> {
    let term = prompt("Image name to search on Docker Hub: ")?;
    if term.is_empty() {
        return Ok(());
    }
    println!("Searching for '{term}'...");
    match docker.search(&term).await {
        Ok(results) => {
            println!("\n--- Search Results for '{term}' ---");
            for result in results.iter().take(5) {
                let description = if result.description.is_empty() {
                    "No description".to_string()
                } else if result.description.chars().count() > 50 {
                    let cut: String = result.description.chars().take(50).collect();
                    format!("{cut}...")
                } else {
                    result.description.clone()
                };
                println!(
                    "Name: {} | Stars: {} | Desc: {}",
                    result.name, result.star_count, description
                );
            }
        }
        Err(e) => report(&e),
    }
    Ok(())
}

async fn pull_image(docker: &DockerBackend) -> anyhow::Result<()> {
    let image = prompt("Image name to pull (e.g. 'ubuntu', 'nginx'): ")?;
    if image.is_empty() {
        return Ok(());
    }
    println!("Pulling '{image}'... (this might take a moment)");
    match docker.pull(&image, |line| println!("{line}")).await {
        Ok(()) => println!("Successfully pulled {image}!"),
        Err(e) => report(&e),
    }
    Ok(())
}

async fn search_local_images(docker: &DockerBackend) -> anyhow::Result<()> {
    let term = prompt("Substring to match against local image tags: ")?;
    match docker.list_images().await {
        Ok(images) => {
            let tags: Vec<String> = images.into_iter().flat_map(|i| i.tags).collect();
            let matches = docker::search_local(&tags, &term);
            if matches.is_empty() {
                println!("No local images match '{term}'.");
            }
            for tag in matches {
                println!("{tag}");
            }
        }
        Err(e) => report(&e),
    }
    Ok(())
}

async fn run_container(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    println!("\n--- Run Container ---");
    let name = prompt("Resource name: ")?;
    let image = prompt("Image (e.g. 'alpine:latest'): ")?;
    let command = prompt("Command (leave empty for the image default): ")?;

    let spec = ContainerSpec {
        name,
        image,
        command: command.split_whitespace().map(str::to_string).collect(),
        env: None,
        memory_mb: None,
        cpu_count: None,
    };
    submit(orchestrator, ResourceSpec::Container(spec)).await;
    Ok(())
}

// --- Resource registry menu ---

async fn resources_menu(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    println!("\n--- Resource Registry ---");
    println!("1. List resources");
    println!("2. Show a resource");
    println!("3. Stop a resource");
    println!("4. Cancel a provisioning resource");
    println!("5. Refresh a resource from its backend");
    println!("0. Back to main menu");

    match prompt("Select operation: ")?.as_str() {
        "1" => list_resources(orchestrator).await,
        "2" => show_resource(orchestrator).await?,
        "3" => stop_resource(orchestrator).await?,
        "4" => cancel_resource(orchestrator).await?,
        "5" => refresh_resource(orchestrator).await?,
        "0" => {}
        _ => println!("Invalid choice."),
    }
    Ok(())
}

async fn list_resources(orchestrator: &Orchestrator) {
    let snapshots = orchestrator.list().await;
    if snapshots.is_empty() {
        println!("No resources tracked in this session.");
        return;
    }
    for snapshot in snapshots {
        let stale = if snapshot.stale { " (stale)" } else { "" };
        println!(
            "{} | {} | {} | {}{}",
            snapshot.id, snapshot.name, snapshot.kind, snapshot.state, stale
        );
    }
}

async fn show_resource(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let id = prompt("Resource id: ")?;
    match orchestrator.get(&id).await {
        Ok(snapshot) => {
            println!("Id:        {}", snapshot.id);
            println!("Name:      {}", snapshot.name);
            println!("Kind:      {}", snapshot.kind);
            println!("State:     {}{}", snapshot.state, if snapshot.stale { " (stale)" } else { "" });
            println!("Created:   {}", snapshot.created_at.to_rfc3339());
            if let Some(backend_ref) = snapshot.backend_ref {
                println!("Backend:   {backend_ref}");
            }
            if let Some(detail) = snapshot.detail {
                println!("Detail:    {detail}");
            }
        }
        Err(e) => report(&e),
    }
    Ok(())
}

async fn stop_resource(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let id = prompt("Resource id: ")?;
    match orchestrator.stop(&id).await {
        Ok(()) => match orchestrator.wait_settled(&id, SETTLE_WAIT).await {
            Ok(snapshot) => println!("Resource is now {}.", snapshot.state),
            Err(e) => report(&e),
        },
        Err(e) => report(&e),
    }
    Ok(())
}

async fn cancel_resource(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let id = prompt("Resource id: ")?;
    match orchestrator.cancel(&id).await {
        Ok(()) => println!("Cancellation requested."),
        Err(e) => report(&e),
    }
    Ok(())
}

async fn refresh_resource(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let id = prompt("Resource id: ")?;
    match orchestrator.refresh(&id).await {
        Ok(snapshot) => println!("{} is {}.", snapshot.id, snapshot.state),
        Err(e) => report(&e),
    }
    Ok(())
}
