//! MCP server implementation using rmcp.
//!
//! Exposes project-confined code execution and environment management as MCP
//! tools.

use std::path::PathBuf;
use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::backend::ProcessBackend;
use crate::config::Config;
use crate::error::Error;
use crate::executor::{ExecutionOptions, ExecutionRequest, Executor, Language};

/// MCP server for sandboxed code execution.
#[derive(Clone)]
pub struct SandboxServer<B: Clone> {
    executor: Arc<Executor<B>>,
    default_project: Option<PathBuf>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    #[schemars(description = "The code to execute")]
    pub code: String,

    #[schemars(description = "Language of the code: 'python' or 'shell'")]
    pub language: String,

    #[schemars(description = "Project directory to run in. Defaults to the configured project")]
    #[serde(default)]
    pub project_path: Option<String>,

    #[schemars(description = "Timeout in seconds")]
    #[serde(default)]
    pub timeout: Option<u64>,

    #[schemars(description = "Working directory, relative to the project")]
    #[serde(default)]
    pub working_dir: Option<String>,

    #[schemars(description = "Capture stdout and stderr (default true)")]
    #[serde(default)]
    pub capture_output: Option<bool>,

    #[schemars(description = "Packages to install into the project environment first")]
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Parameters for the prepare_environment tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PrepareParams {
    #[schemars(description = "Project directory. Defaults to the configured project")]
    #[serde(default)]
    pub project_path: Option<String>,

    #[schemars(description = "Packages to install")]
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Parameters for the release_environment tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReleaseParams {
    #[schemars(description = "Project directory. Defaults to the configured project")]
    #[serde(default)]
    pub project_path: Option<String>,
}

#[derive(Serialize)]
struct Released {
    released: bool,
}

#[tool_router]
impl<B: ProcessBackend + Clone + 'static> SandboxServer<B> {
    /// Create a new sandbox server.
    pub fn new(executor: Executor<B>, default_project: Option<PathBuf>) -> Self {
        Self {
            executor: Arc::new(executor),
            default_project,
            tool_router: Self::tool_router(),
        }
    }

    /// Execute code inside a project directory.
    #[tool(description = "Execute Python or shell code confined to a project directory")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let language: Language = params.language.parse().map_err(|e| to_mcp_error(&e))?;
        let project_path = self.project(params.project_path)?;

        let request = ExecutionRequest {
            code: params.code,
            language,
            project_path,
            options: ExecutionOptions {
                timeout_seconds: params.timeout,
                working_dir: params.working_dir.map(PathBuf::from),
                capture_output: params.capture_output.unwrap_or(true),
                packages: params.packages,
            },
        };

        info!(%language, code_len = request.code.len(), "Executing code");

        let result = self.executor.execute(&request).await.map_err(|e| {
            error!(error = %e, "Execution rejected");
            to_mcp_error(&e)
        })?;

        let content = vec![Content::text(to_json(&result)?)];
        if result.success {
            Ok(CallToolResult::success(content))
        } else {
            Ok(CallToolResult::error(content))
        }
    }

    /// Create or repair a project environment ahead of execution.
    #[tool(description = "Create the project's isolated environment and install packages")]
    async fn prepare_environment(
        &self,
        Parameters(params): Parameters<PrepareParams>,
    ) -> Result<CallToolResult, McpError> {
        let project_path = self.project(params.project_path)?;

        let env = self
            .executor
            .environments()
            .acquire(&project_path, &params.packages)
            .await
            .map_err(|e| {
                error!(error = %e, "Environment preparation failed");
                to_mcp_error(&e)
            })?;

        Ok(CallToolResult::success(vec![Content::text(to_json(&env)?)]))
    }

    /// Delete a project environment.
    #[tool(description = "Delete the project's isolated environment from disk")]
    async fn release_environment(
        &self,
        Parameters(params): Parameters<ReleaseParams>,
    ) -> Result<CallToolResult, McpError> {
        let project_path = self.project(params.project_path)?;

        let released = self
            .executor
            .environments()
            .release(&project_path)
            .await
            .map_err(|e| to_mcp_error(&e))?;

        Ok(CallToolResult::success(vec![Content::text(to_json(&Released {
            released,
        })?)]))
    }

    fn project(&self, requested: Option<String>) -> Result<PathBuf, McpError> {
        requested
            .map(PathBuf::from)
            .or_else(|| self.default_project.clone())
            .ok_or_else(|| {
                McpError::invalid_params(
                    "No project_path given and no default project configured",
                    Some(json!({ "error": "EXECUTION_ERROR" })),
                )
            })
    }
}

#[tool_handler]
impl<B: ProcessBackend + Clone + 'static> ServerHandler for SandboxServer<B> {
    fn get_info(&self) -> ServerInfo {
        let project = self
            .default_project
            .as_ref()
            .map_or_else(|| "none".to_string(), |p| p.display().to_string());

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "code-sandbox".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Execute code confined to a project directory, using a per-project \
                 isolated Python environment.\n\
                 Default project: {project}\n\
                 \n\
                 Use the 'execute' tool with:\n\
                 - language: 'python' or 'shell'\n\
                 - code: the code to run\n\
                 - project_path, timeout, working_dir, capture_output, packages: optional"
            )),
        }
    }
}

/// Map a library error onto an MCP error carrying its kind.
fn to_mcp_error(err: &Error) -> McpError {
    let data = Some(json!({ "error": err.kind() }));
    if err.is_caller_error() {
        McpError::invalid_params(err.to_string(), data)
    } else if err.is_access_denied() {
        warn!(error = %err, "Access denied");
        McpError::invalid_request(err.to_string(), data)
    } else {
        McpError::internal_error(err.to_string(), data)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, McpError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Failed to encode result: {e}"), None))
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio<B: ProcessBackend + Clone + 'static>(
    config: Config,
    backend: B,
) -> anyhow::Result<()> {
    let default_project = config.resolved_project_dir();
    let server = SandboxServer::new(Executor::new(&config, backend), default_project);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Invocation, RunOutcome};
    use async_trait::async_trait;
    use rmcp::model::ErrorCode;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    /// Backend that answers every run with a fixed exit code and echoes the
    /// snippet on stdout.
    #[derive(Clone)]
    struct MockBackend {
        exit_code: i32,
    }

    #[async_trait]
    impl ProcessBackend for MockBackend {
        async fn run(&self, invocation: &Invocation, _timeout: Duration) -> RunOutcome {
            RunOutcome::Completed {
                exit_code: self.exit_code,
                stdout: format!("executed: {}", invocation.args.join(" ")),
                stderr: String::new(),
            }
        }
    }

    fn server(exit_code: i32, default_project: Option<PathBuf>) -> SandboxServer<MockBackend> {
        let executor = Executor::new(&Config::default(), MockBackend { exit_code });
        SandboxServer::new(executor, default_project)
    }

    /// Project whose environment already exists, so no provisioning runs.
    fn seeded_project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(".venv/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("python"), "").unwrap();
        dir
    }

    fn execute_params(project: &Path, language: &str) -> ExecuteParams {
        ExecuteParams {
            code: "print('hi')".to_string(),
            language: language.to_string(),
            project_path: Some(project.display().to_string()),
            timeout: None,
            working_dir: None,
            capture_output: None,
            packages: Vec::new(),
        }
    }

    fn text(result: &CallToolResult) -> String {
        result.content[0].as_text().unwrap().text.clone()
    }

    #[tokio::test]
    async fn test_execute_success() {
        let project = seeded_project();
        let server = server(0, None);

        let result = server
            .execute(Parameters(execute_params(project.path(), "python")))
            .await
            .unwrap();

        assert!(!result.is_error.unwrap_or(false));
        let body: serde_json::Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["exit_code"], 0);
        assert!(body["stdout"].as_str().unwrap().contains("print('hi')"));
    }

    #[tokio::test]
    async fn test_execute_failure_is_tool_error() {
        let project = seeded_project();
        let server = server(2, None);

        let result = server
            .execute(Parameters(execute_params(project.path(), "shell")))
            .await
            .unwrap();

        assert!(result.is_error.unwrap_or(false));
        let body: serde_json::Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(body["exit_code"], 2);
    }

    #[tokio::test]
    async fn test_execute_unknown_language() {
        let project = seeded_project();
        let err = server(0, None)
            .execute(Parameters(execute_params(project.path(), "cobol")))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
        assert_eq!(err.data, Some(json!({ "error": "EXECUTION_ERROR" })));
    }

    #[tokio::test]
    async fn test_execute_escape_is_invalid_request() {
        let project = seeded_project();
        let mut params = execute_params(project.path(), "shell");
        params.working_dir = Some("../../etc".to_string());

        let err = server(0, None).execute(Parameters(params)).await.unwrap_err();

        assert_eq!(err.code, ErrorCode::INVALID_REQUEST);
        assert_eq!(err.data, Some(json!({ "error": "SECURITY_ERROR" })));
    }

    #[tokio::test]
    async fn test_execute_invalid_project() {
        let err = server(0, None)
            .execute(Parameters(execute_params(Path::new("/nonexistent/path"), "shell")))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::INVALID_REQUEST);
        assert_eq!(err.data, Some(json!({ "error": "PATH_VIOLATION" })));
    }

    #[tokio::test]
    async fn test_execute_uses_default_project() {
        let project = seeded_project();
        let server = server(0, Some(project.path().to_path_buf()));
        let mut params = execute_params(project.path(), "python");
        params.project_path = None;

        let result = server.execute(Parameters(params)).await.unwrap();
        assert!(!result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn test_execute_without_any_project() {
        let mut params = execute_params(Path::new("/unused"), "python");
        params.project_path = None;

        let err = server(0, None).execute(Parameters(params)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_environment_failure_is_internal_error() {
        // No seeded environment and every provisioning step fails.
        let project = tempfile::tempdir().unwrap();
        let params = PrepareParams {
            project_path: Some(project.path().display().to_string()),
            packages: Vec::new(),
        };

        let err = server(1, None)
            .prepare_environment(Parameters(params))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(err.data, Some(json!({ "error": "ENVIRONMENT_ERROR" })));
    }

    #[tokio::test]
    async fn test_prepare_and_release() {
        let project = seeded_project();
        let server = server(0, None);
        let path = project.path().display().to_string();

        let prepared = server
            .prepare_environment(Parameters(PrepareParams {
                project_path: Some(path.clone()),
                packages: Vec::new(),
            }))
            .await
            .unwrap();
        let env: serde_json::Value = serde_json::from_str(&text(&prepared)).unwrap();
        assert_eq!(env["status"], "ready");

        // Idempotent: the second release finds nothing and still succeeds.
        for _ in 0..2 {
            let released = server
                .release_environment(Parameters(ReleaseParams {
                    project_path: Some(path.clone()),
                }))
                .await
                .unwrap();
            let body: serde_json::Value = serde_json::from_str(&text(&released)).unwrap();
            assert_eq!(body["released"], true);
            assert!(!project.path().join(".venv").exists());
        }
    }

    #[test]
    fn test_get_info() {
        let info = server(0, Some(PathBuf::from("/work/proj"))).get_info();
        assert_eq!(info.server_info.name, "code-sandbox");
        assert!(info.instructions.unwrap().contains("/work/proj"));
    }
}
