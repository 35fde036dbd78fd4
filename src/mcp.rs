use std::time::Duration;

use rmcp::{
    ErrorData as McpError, ServerHandler, ServiceExt,
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::domain::{ApplyResult, FileReport, SandboxError};
use crate::exec::{Executor, LocalExecutor, ShellCommand, ShellRequest, ShellSettings};
use crate::fs_tools::{EntryKind, FileToolSettings, FileTools, SearchHit};
use crate::patch::{self, PatchApplier};
use crate::sandbox::SandboxRoot;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ApplyPatchArgs {
    /// Patch text wrapped in `*** Begin Patch` / `*** End Patch`.
    pub patch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum CommandArg {
    /// Run through the shell.
    Line(String),
    /// Program followed by its arguments, run without a shell.
    Argv(Vec<String>),
}

impl From<CommandArg> for ShellCommand {
    fn from(arg: CommandArg) -> Self {
        match arg {
            CommandArg::Line(line) => ShellCommand::Line(line),
            CommandArg::Argv(argv) => ShellCommand::Argv(argv),
        }
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ShellArgs {
    pub command: CommandArg,
    /// Working directory relative to the sandbox root.
    pub workdir: String,
    /// Timeout in seconds; 0 disables it.
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// Glob pattern or substring; empty lists the root.
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct FetchArgs {
    /// Path of a file or directory, as returned by `search`.
    pub id: String,
}

#[derive(Serialize)]
struct PatchReport {
    results: Vec<FileReport>,
}

#[derive(Serialize)]
struct SearchReport {
    results: Vec<SearchHit>,
}

#[derive(Serialize)]
struct PathReport {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<EntryKind>,
}

#[derive(Clone)]
pub struct SandpitServer {
    root: SandboxRoot,
    config: Config,
    applier: PatchApplier,
    executor: LocalExecutor,
    files: FileTools,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl SandpitServer {
    pub fn new(root: SandboxRoot, config: Config) -> Self {
        Self {
            applier: PatchApplier::new(root.clone()),
            executor: LocalExecutor::new(root.clone(), ShellSettings::from_config(&config.shell)),
            files: FileTools::new(root.clone(), FileToolSettings::from_config(&config)),
            root,
            config,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "apply_patch",
        description = "Apply a multi-file patch inside the sandbox and report the outcome per file"
    )]
    async fn apply_patch(
        &self,
        Parameters(args): Parameters<ApplyPatchArgs>,
    ) -> Result<CallToolResult, McpError> {
        let applier = self.applier.clone();
        let results = blocking(move || {
            let patch = patch::parse(&args.patch)?;
            Ok(applier.apply(&patch).iter().map(ApplyResult::report).collect())
        })
        .await?;
        json(PatchReport { results })
    }

    #[tool(
        name = "shell",
        description = "Run a command in the sandbox and return its exit code and captured output"
    )]
    async fn shell(&self, Parameters(args): Parameters<ShellArgs>) -> Result<CallToolResult, McpError> {
        let request = ShellRequest {
            command: args.command.into(),
            workdir: args.workdir,
            timeout: command_timeout(args.timeout, self.config.shell.default_timeout_secs()),
        };
        let result = self.executor.run(&request).await.map_err(map_error)?;
        json(result)
    }

    #[tool(name = "write_file", description = "Create or overwrite a file in the sandbox")]
    async fn write_file(
        &self,
        Parameters(args): Parameters<WriteFileArgs>,
    ) -> Result<CallToolResult, McpError> {
        let files = self.files.clone();
        let report = blocking(move || files.write_file(&args.path, &args.content)).await?;
        json(report)
    }

    #[tool(
        name = "create_directory",
        description = "Create a directory, including missing parents, in the sandbox"
    )]
    async fn create_directory(
        &self,
        Parameters(args): Parameters<PathArgs>,
    ) -> Result<CallToolResult, McpError> {
        let files = self.files.clone();
        let path = blocking(move || files.create_directory(&args.path)).await?;
        json(PathReport { path, kind: None })
    }

    #[tool(
        name = "delete_file",
        description = "Delete a file, or a directory and everything below it, in the sandbox"
    )]
    async fn delete_file(
        &self,
        Parameters(args): Parameters<PathArgs>,
    ) -> Result<CallToolResult, McpError> {
        let files = self.files.clone();
        let path = args.path.clone();
        let kind = blocking(move || files.delete_file(&args.path)).await?;
        json(PathReport {
            path,
            kind: Some(kind),
        })
    }

    #[tool(name = "search", description = "Search sandbox paths by glob pattern or substring")]
    async fn search(&self, Parameters(args): Parameters<SearchArgs>) -> Result<CallToolResult, McpError> {
        let files = self.files.clone();
        let results = blocking(move || files.search(&args.query)).await?;
        json(SearchReport { results })
    }

    #[tool(name = "fetch", description = "Read a file or list a directory in the sandbox")]
    async fn fetch(&self, Parameters(args): Parameters<FetchArgs>) -> Result<CallToolResult, McpError> {
        let files = self.files.clone();
        let document = blocking(move || files.fetch(&args.id)).await?;
        json(document)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for SandpitServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(format!(
                "Sandboxed file editing and shell execution rooted at {}",
                self.root.path().display()
            )),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

pub async fn run_stdio(root: SandboxRoot, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let service = SandpitServer::new(root, config)
        .serve(stdio())
        .await
        .inspect_err(|e| {
            log::error!("Error starting MCP server: {e}");
        })?;
    service.waiting().await?;
    Ok(())
}

/// Omitted falls back to the configured default; zero means no limit.
fn command_timeout(requested: Option<u64>, default_secs: u64) -> Option<Duration> {
    match requested.unwrap_or(default_secs) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

async fn blocking<T, F>(work: F) -> Result<T, McpError>
where
    F: FnOnce() -> Result<T, SandboxError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| McpError::internal_error(error.to_string(), None))?
        .map_err(map_error)
}

fn json(value: impl Serialize) -> Result<CallToolResult, McpError> {
    let content =
        Content::json(value).map_err(|error| McpError::internal_error(error.to_string(), None))?;
    Ok(CallToolResult::success(vec![content]))
}

fn map_error(error: SandboxError) -> McpError {
    let data = Some(serde_json::json!({ "kind": error.kind() }));
    if error.is_caller_error() {
        McpError::invalid_params(error.to_string(), data)
    } else {
        McpError::internal_error(error.to_string(), data)
    }
}
