use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use runbox::api::{run_api_until, ApiState, CancelResponse, QueueResponse, SubmitResponse};
use runbox::config::{
    FunctionConfig, LocalBackendConfig, RemoteBackendConfig, ResourceLimits, ServerConfig,
    ServiceConfig, WorkerConfig,
};
use runbox::execution::{
    Execution, ExecutionManager, ExecutionRepository, FileExecutionRepository,
    InMemoryExecutionRepository,
};
use runbox::queue::{PoolMetrics, QueueService};
use runbox::sandbox::function::run_function_server;
use runbox::sandbox::{LocalBackend, RemoteBackend, SandboxBackend};
use runbox::service::{ExecutionResultView, ExecutionService, StatusView};
use runbox::shutdown::install_shutdown_handler;
use runbox::worker::WorkerPool;

#[derive(Parser, Debug)]
#[command(name = "runbox")]
#[command(version)]
#[command(about = "Run untrusted code in disposable sandboxes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator: HTTP API plus worker pool
    Serve(ServeArgs),

    /// Host the function-execution platform used by the remote backend
    Function(FunctionArgs),

    /// Run a file once on the local backend and print the result
    Exec(ExecArgs),

    /// Execution management commands against a running orchestrator
    Execution {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ExecutionCommands,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Local,
    Remote,
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to bind the HTTP API to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Backend for queued and synchronous executions
    #[arg(long, value_enum, default_value = "local")]
    backend: BackendArg,

    /// Base URL of the function platform (remote backend)
    #[arg(long, default_value = "http://127.0.0.1:9090")]
    remote_url: String,

    /// API key sent to the function platform
    #[arg(long)]
    api_key: Option<String>,

    /// Number of worker loops
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Directory for execution records (in-memory when omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Default execution timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Default memory limit in MB
    #[arg(long, default_value = "512")]
    memory_mb: u64,

    /// Seconds before an unacknowledged execution is redelivered
    #[arg(long, default_value = "300")]
    visibility_timeout: u64,

    /// Python interpreter for the local backend
    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Reject requests the local backend cannot fully isolate
    #[arg(long)]
    strict_isolation: bool,
}

#[derive(Parser, Debug)]
struct FunctionArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value = "9090")]
    port: u16,

    /// Require this value in the X-API-Key header
    #[arg(long)]
    api_key: Option<String>,

    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Ceiling applied to requested timeouts, in seconds
    #[arg(long, default_value = "900")]
    max_timeout: u64,

    /// Ceiling applied to requested memory, in MB
    #[arg(long, default_value = "1024")]
    memory_mb: u64,
}

#[derive(Parser, Debug)]
struct ExecArgs {
    /// Python file to run
    file: PathBuf,

    /// JSON object bound to `input_data`
    #[arg(long)]
    input: Option<String>,

    /// Timeout in seconds
    #[arg(long)]
    timeout: Option<i64>,

    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Do not require the code to bind a `result` variable
    #[arg(long)]
    no_result: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Orchestrator address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum ExecutionCommands {
    /// Queue a file for asynchronous execution
    Submit {
        file: PathBuf,
        #[arg(long)]
        input: Option<String>,
    },
    /// Run a file synchronously on the server
    Run {
        file: PathBuf,
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        timeout: Option<i64>,
        /// Use the server's local backend
        #[arg(long)]
        local: bool,
    },
    /// Get status of an execution
    Status { execution_id: String },
    /// Get the result of a completed execution
    Result { execution_id: String },
    /// Cancel a queued or running execution
    Cancel { execution_id: String },
    /// List executions by status
    List {
        #[arg(long, default_value = "QUEUED")]
        status: String,
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Show the waiting queue
    Queue,
    /// Show pool metrics
    Metrics,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn parse_input(input: Option<String>) -> Result<Option<Value>, Box<dyn std::error::Error>> {
    match input {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

async fn build_repository(
    data_dir: Option<PathBuf>,
) -> Result<Arc<dyn ExecutionRepository>, Box<dyn std::error::Error>> {
    Ok(match data_dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "Using file-backed execution repository");
            Arc::new(FileExecutionRepository::open(dir).await?)
        }
        None => {
            tracing::warn!("No --data-dir given, execution records are kept in memory only");
            Arc::new(InMemoryExecutionRepository::new())
        }
    })
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let limits = ResourceLimits::default()
        .with_timeout(args.timeout)
        .with_memory_mb(args.memory_mb);

    let config = ServerConfig {
        listen_addr,
        data_dir: args.data_dir,
        service: ServiceConfig::default()
            .with_default_limits(limits)
            .with_visibility_timeout(Duration::from_secs(args.visibility_timeout))
            .with_sandbox_capacity(args.workers),
        worker: WorkerConfig {
            workers: args.workers,
            ..WorkerConfig::default()
        },
    };

    let local: Arc<dyn SandboxBackend> = Arc::new(LocalBackend::new(LocalBackendConfig {
        interpreter: args.interpreter,
        strict_isolation: args.strict_isolation,
        ..LocalBackendConfig::default()
    }));
    let backend: Arc<dyn SandboxBackend> = match args.backend {
        BackendArg::Local => local.clone(),
        BackendArg::Remote => {
            let remote = RemoteBackend::new(RemoteBackendConfig {
                base_url: args.remote_url,
                api_key: args.api_key,
                ..RemoteBackendConfig::default()
            })?;
            if let Err(e) = remote.health().await {
                tracing::warn!(url = remote.base_url(), error = %e, "Function platform not reachable yet");
            }
            Arc::new(remote)
        }
    };
    config
        .service
        .validate_for_backend(backend.max_overhead().max(local.max_overhead()))?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        backend = %backend.kind(),
        workers = config.worker.workers,
        timeout_seconds = config.service.default_limits.timeout_seconds,
        "Starting runbox"
    );

    let repository = build_repository(config.data_dir.clone()).await?;
    let queue = Arc::new(QueueService::new(config.service.queue.clone()));
    let manager = Arc::new(ExecutionManager::new());
    let service = Arc::new(ExecutionService::new(
        repository,
        queue,
        manager,
        backend,
        local,
        config.service.clone(),
    ));
    service.recover().await?;

    let shutdown = install_shutdown_handler()?;
    let pool = WorkerPool::spawn(service.clone(), config.worker.clone(), shutdown.clone());

    let state = ApiState { service };
    let served = run_api_until(config.listen_addr, state, shutdown.clone()).await;
    shutdown.cancel();
    pool.join().await;
    served?;
    Ok(())
}

async fn run_function(args: FunctionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = FunctionConfig {
        listen_addr: format!("{}:{}", args.host, args.port).parse()?,
        interpreter: args.interpreter,
        api_key: args.api_key,
        max_timeout_seconds: args.max_timeout,
        memory_mb: args.memory_mb,
    };
    run_function_server(config).await?;
    Ok(())
}

async fn run_exec(args: ExecArgs) -> Result<(), Box<dyn std::error::Error>> {
    let code = tokio::fs::read_to_string(&args.file).await?;
    let input = parse_input(args.input)?;

    let local: Arc<dyn SandboxBackend> = Arc::new(LocalBackend::new(LocalBackendConfig {
        interpreter: args.interpreter,
        require_result: !args.no_result,
        ..LocalBackendConfig::default()
    }));
    let service = ExecutionService::new(
        Arc::new(InMemoryExecutionRepository::new()),
        Arc::new(QueueService::default()),
        Arc::new(ExecutionManager::new()),
        local.clone(),
        local,
        ServiceConfig::default(),
    );

    let outcome = service.execute_local(code, input, args.timeout).await?;
    println!("{}", serde_json::to_string_pretty(&outcome.view())?);
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(addr: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: addr.trim_end_matches('/').to_string(),
        }
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            return Err(format!("{} ({})", message, status).into());
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Box<dyn std::error::Error>> {
        let response = self.http.get(format!("{}{}", self.base, path)).send().await?;
        Self::decode(response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_result(view: &ExecutionResultView) {
    println!("Execution ID:    {}", view.execution_id);
    println!("Status:          {}", view.status);
    println!("Exit Code:       {}", view.exit_code);
    println!("Duration:        {} ms", view.execution_time_ms);
    if let Some(ref error) = view.error {
        println!("Error:           {}", error);
    }
    if !view.stdout.is_empty() {
        println!("Stdout:");
        for line in view.stdout.lines() {
            println!("  {}", line);
        }
    }
    if !view.stderr.is_empty() {
        println!("Stderr:");
        for line in view.stderr.lines() {
            println!("  {}", line);
        }
    }
    for (name, contents) in &view.output_files {
        println!("File {}:", name);
        for line in contents.lines() {
            println!("  {}", line);
        }
    }
}

async fn handle_execution_command(
    client: ClientArgs,
    command: ExecutionCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let api = ApiClient::new(&client.addr);
    let json = matches!(client.output, OutputFormat::Json);

    match command {
        ExecutionCommands::Submit { file, input } => {
            let code = tokio::fs::read_to_string(&file).await?;
            let body = serde_json::json!({ "code": code, "input_data": parse_input(input)? });
            let response: SubmitResponse = api.post("/api/executions", &body).await?;
            if json {
                print_json(&response)?;
            } else {
                println!("Execution submitted successfully!");
                println!("Execution ID: {}", response.execution_id);
            }
        }
        ExecutionCommands::Run {
            file,
            input,
            timeout,
            local,
        } => {
            let code = tokio::fs::read_to_string(&file).await?;
            let body = serde_json::json!({
                "code": code,
                "input_data": parse_input(input)?,
                "timeout_seconds": timeout,
            });
            let path = if local {
                "/api/executions/local"
            } else {
                "/api/executions/sync"
            };
            let view: ExecutionResultView = api.post(path, &body).await?;
            if json {
                print_json(&view)?;
            } else {
                print_result(&view);
            }
        }
        ExecutionCommands::Status { execution_id } => {
            let status: StatusView = api
                .get(&format!("/api/executions/{}", execution_id))
                .await?;
            if json {
                print_json(&status)?;
            } else {
                println!("Execution ID:    {}", status.execution_id);
                println!("Status:          {}", status.status);
                println!("Created:         {}", status.created_at);
                if let Some(started) = status.started_at {
                    println!("Started:         {}", started);
                }
                if let Some(completed) = status.completed_at {
                    println!("Completed:       {}", completed);
                }
                if let Some(ref result) = status.result {
                    println!("Exit Code:       {}", result.exit_code);
                }
                if let Some(ref error) = status.error {
                    println!("Error:           {}", error);
                }
            }
        }
        ExecutionCommands::Result { execution_id } => {
            let view: ExecutionResultView = api
                .get(&format!("/api/executions/{}/result", execution_id))
                .await?;
            if json {
                print_json(&view)?;
            } else {
                print_result(&view);
            }
        }
        ExecutionCommands::Cancel { execution_id } => {
            let response: CancelResponse = api
                .post(
                    &format!("/api/executions/{}/cancel", execution_id),
                    &Value::Null,
                )
                .await?;
            if json {
                print_json(&response)?;
            } else if response.cancelled {
                println!("Execution {} cancelled", response.execution_id);
            } else {
                println!(
                    "Execution {} was not cancelled (finished, unknown, or already running remotely)",
                    response.execution_id
                );
            }
        }
        ExecutionCommands::List { status, limit } => {
            let executions: Vec<Execution> = api
                .get(&format!("/api/executions?status={}&limit={}", status, limit))
                .await?;
            if json {
                print_json(&executions)?;
            } else {
                println!("{:<38} {:<12} {:<26}", "EXECUTION ID", "STATUS", "CREATED");
                println!("{}", "-".repeat(76));
                for execution in &executions {
                    println!(
                        "{:<38} {:<12} {:<26}",
                        execution.id,
                        execution.status,
                        execution.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!();
                println!("Total: {} executions", executions.len());
            }
        }
        ExecutionCommands::Queue => {
            let queue: QueueResponse = api.get("/api/queue").await?;
            if json {
                print_json(&queue)?;
            } else {
                println!("Queue Length:    {}", queue.stats.queue_length);
                println!("Processing:      {}", queue.stats.processing_count);
                println!("Redelivered:     {}", queue.stats.redelivered_total);
                for id in &queue.next {
                    println!("  {}", id);
                }
            }
        }
        ExecutionCommands::Metrics => {
            let metrics: PoolMetrics = api.get("/api/metrics").await?;
            if json {
                print_json(&metrics)?;
            } else {
                println!("Sandboxes:       {} total", metrics.total_sandboxes);
                println!("  Available:     {}", metrics.available_sandboxes);
                println!("  Busy:          {}", metrics.busy_sandboxes);
                println!("  Initializing:  {}", metrics.initializing_sandboxes);
                println!("  Unhealthy:     {}", metrics.unhealthy_sandboxes);
                println!("  Terminated:    {}", metrics.terminated_sandboxes);
                println!("Queue Length:    {}", metrics.queue_length);
                println!("Processing:      {}", metrics.processing_count);
                println!(
                    "Avg Duration:    {:.1} ms",
                    metrics.average_execution_time_ms
                );
                println!("Uptime:          {} s", metrics.uptime_seconds);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(server_args) => {
            init_logging();
            run_serve(server_args).await
        }
        Commands::Function(function_args) => {
            init_logging();
            run_function(function_args).await
        }
        Commands::Exec(exec_args) => run_exec(exec_args).await,
        Commands::Execution { client, command } => {
            if let Err(e) = handle_execution_command(client, command).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
