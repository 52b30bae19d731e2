use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use cdb_driver_core::{
    new_debugger, process, Debugger, DebuggerEvent, DebuggerEventKind, DriverConfig,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

const MAX_CONSOLE_LOG_EVENTS: usize = 1000;
const DEFAULT_CONSOLE_LOG_COUNT: usize = 50;
const DEFAULT_EVENT_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerAttachParams {
    pid: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerLaunchParams {
    executable: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSetBreakpointParams {
    file: String,
    line: u32,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSetFunctionBreakpointParams {
    function: String,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerRemoveBreakpointParams {
    id: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerLocalsParams {
    #[serde(default)]
    frame_index: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerEvaluateParams {
    expression: String,
    #[serde(default)]
    frame_index: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerWaitForEventParams {
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerConsoleLogParams {
    #[serde(default)]
    count: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerListProcessesParams {
    #[serde(default)]
    name_filter: Option<String>,
}

/// Bounded in-memory log of session events, fed by the driver's event
/// subscriptions and served through the `debugger_console_log` tool.
struct ConsoleLog {
    entries: StdMutex<VecDeque<DebuggerEvent>>,
}

impl ConsoleLog {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: StdMutex::new(VecDeque::new()),
        })
    }

    fn push(&self, event: DebuggerEvent) {
        let mut entries = self.entries.lock().expect("console log mutex poisoned");
        push_console_event(&mut entries, event);
    }

    fn tail(&self, count: usize) -> Vec<DebuggerEvent> {
        let entries = self.entries.lock().expect("console log mutex poisoned");
        entries
            .iter()
            .rev()
            .take(count)
            .rev()
            .cloned()
            .collect()
    }
}

fn push_console_event(entries: &mut VecDeque<DebuggerEvent>, event: DebuggerEvent) {
    entries.push_back(event);
    while entries.len() > MAX_CONSOLE_LOG_EVENTS {
        entries.pop_front();
    }
}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

fn driver_error(e: cdb_driver_core::DriverError) -> McpError {
    to_mcp_error(e.to_string())
}

#[derive(Clone)]
struct CdbMcpServer {
    tool_router: ToolRouter<Self>,
    driver: Arc<Mutex<Option<Box<dyn Debugger>>>>,
    console_log: Arc<ConsoleLog>,
}

#[tool_router]
impl CdbMcpServer {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
            driver: Arc::new(Mutex::new(None)),
            console_log: ConsoleLog::new(),
        }
    }

    /// Build the backend on first use and wire every event kind into the
    /// console log. The backend survives detach, so this runs once.
    fn ensure_driver<'a>(
        &self,
        slot: &'a mut Option<Box<dyn Debugger>>,
    ) -> Result<&'a mut Box<dyn Debugger>, McpError> {
        if slot.is_none() {
            let driver = new_debugger(DriverConfig::from_env()).map_err(|e| {
                to_mcp_error(format!("Failed to initialize debugger backend: {e}"))
            })?;
            for kind in DebuggerEventKind::ALL {
                let log = self.console_log.clone();
                driver.register_event_callback(kind, Arc::new(move |event| log.push(event)));
            }
            *slot = Some(driver);
        }
        slot.as_mut()
            .ok_or_else(|| to_mcp_error("Debugger backend unavailable"))
    }

    #[tool(description = "Attach the debugger to a running process by pid")]
    async fn debugger_attach(
        &self,
        params: Parameters<DebuggerAttachParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;

        driver.attach(params.pid).await.map_err(driver_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "pid": params.pid,
            "state": driver.get_state(),
        })))
    }

    #[tool(description = "Launch an executable under the debugger")]
    async fn debugger_launch(
        &self,
        params: Parameters<DebuggerLaunchParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;

        let pid = driver
            .launch(Path::new(&params.executable), &params.args)
            .await
            .map_err(driver_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "pid": pid,
            "state": driver.get_state(),
        })))
    }

    #[tool(description = "Detach the debugger, leaving the target running")]
    async fn debugger_detach(&self) -> Result<CallToolResult, McpError> {
        let mut slot = self.driver.lock().await;
        let Some(driver) = slot.as_mut() else {
            return Ok(CallToolResult::structured(json!({
                "ok": true,
                "state": "idle",
            })));
        };

        driver.detach().await.map_err(driver_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": driver.get_state(),
        })))
    }

    #[tool(description = "Resume execution of a paused target")]
    async fn debugger_continue(&self) -> Result<CallToolResult, McpError> {
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;
        driver.continue_execution().await.map_err(driver_error)?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": driver.get_state(),
        })))
    }

    #[tool(description = "Step over the current source line")]
    async fn debugger_step_over(&self) -> Result<CallToolResult, McpError> {
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;
        driver.step_over().await.map_err(driver_error)?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": driver.get_state(),
        })))
    }

    #[tool(description = "Step into the next function call")]
    async fn debugger_step_into(&self) -> Result<CallToolResult, McpError> {
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;
        driver.step_into().await.map_err(driver_error)?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": driver.get_state(),
        })))
    }

    #[tool(description = "Step out of the current function")]
    async fn debugger_step_out(&self) -> Result<CallToolResult, McpError> {
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;
        driver.step_out().await.map_err(driver_error)?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": driver.get_state(),
        })))
    }

    #[tool(description = "Force a running target to pause at the debugger prompt")]
    async fn debugger_break(&self) -> Result<CallToolResult, McpError> {
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;
        driver.break_into().await.map_err(driver_error)?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": driver.get_state(),
        })))
    }

    #[tool(description = "Set a source-line breakpoint")]
    async fn debugger_set_breakpoint(
        &self,
        params: Parameters<DebuggerSetBreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;

        let id = driver
            .set_breakpoint(&params.file, params.line, params.condition.as_deref())
            .await
            .map_err(driver_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "breakpoint_id": id,
        })))
    }

    #[tool(description = "Set a breakpoint on a function by name")]
    async fn debugger_set_function_breakpoint(
        &self,
        params: Parameters<DebuggerSetFunctionBreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;

        let id = driver
            .set_function_breakpoint(&params.function, params.condition.as_deref())
            .await
            .map_err(driver_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "breakpoint_id": id,
        })))
    }

    #[tool(description = "Remove a breakpoint by id")]
    async fn debugger_remove_breakpoint(
        &self,
        params: Parameters<DebuggerRemoveBreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;

        let removed = driver
            .remove_breakpoint(params.id)
            .await
            .map_err(driver_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "removed": removed,
        })))
    }

    #[tool(description = "List registered breakpoints")]
    async fn debugger_list_breakpoints(&self) -> Result<CallToolResult, McpError> {
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "breakpoints": driver.list_breakpoints(),
        })))
    }

    #[tool(description = "Get the call stack of the paused target")]
    async fn debugger_stack_trace(&self) -> Result<CallToolResult, McpError> {
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;
        let frames = driver.get_stack_trace().await.map_err(driver_error)?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "frames": frames,
        })))
    }

    #[tool(description = "Get the innermost stack frame of the paused target")]
    async fn debugger_current_frame(&self) -> Result<CallToolResult, McpError> {
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;
        let frame = driver.get_current_frame().await.map_err(driver_error)?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "frame": frame,
        })))
    }

    #[tool(description = "Read local variables of a stack frame")]
    async fn debugger_locals(
        &self,
        params: Parameters<DebuggerLocalsParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;

        let variables = driver
            .get_local_variables(params.frame_index)
            .await
            .map_err(driver_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "frame_index": params.frame_index,
            "variables": variables,
        })))
    }

    #[tool(description = "Evaluate an expression in the paused target")]
    async fn debugger_evaluate(
        &self,
        params: Parameters<DebuggerEvaluateParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;

        let result = driver
            .evaluate_expression(&params.expression, params.frame_index)
            .await
            .map_err(driver_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "expression": params.expression,
            "result": result,
        })))
    }

    #[tool(description = "Block until a breakpoint, exception, or termination event")]
    async fn debugger_wait_for_event(
        &self,
        params: Parameters<DebuggerWaitForEventParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let wait = params
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_EVENT_WAIT);

        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;
        let event = driver.wait_for_event(wait).await.map_err(driver_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "timed_out": event.is_none(),
            "event": event,
        })))
    }

    #[tool(description = "Collect a structured report for a crashed target")]
    async fn debugger_analyze_crash(&self) -> Result<CallToolResult, McpError> {
        let mut slot = self.driver.lock().await;
        let driver = self.ensure_driver(&mut slot)?;
        let crash = driver.analyze_crash().await.map_err(driver_error)?;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "crash": crash,
        })))
    }

    #[tool(description = "Report the current debugger session state")]
    async fn debugger_state(&self) -> Result<CallToolResult, McpError> {
        let slot = self.driver.lock().await;
        let Some(driver) = slot.as_ref() else {
            return Ok(CallToolResult::structured(json!({
                "ok": true,
                "state": "idle",
                "attached": false,
            })));
        };
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": driver.get_state(),
            "attached": driver.is_attached(),
        })))
    }

    #[tool(description = "Read recent debugger session events")]
    async fn debugger_console_log(
        &self,
        params: Parameters<DebuggerConsoleLogParams>,
    ) -> Result<CallToolResult, McpError> {
        let count = params.0.count.unwrap_or(DEFAULT_CONSOLE_LOG_COUNT);
        let events = self.console_log.tail(count);
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "count": events.len(),
            "events": events,
        })))
    }

    #[tool(description = "List running processes, optionally filtered by name")]
    async fn debugger_list_processes(
        &self,
        params: Parameters<DebuggerListProcessesParams>,
    ) -> Result<CallToolResult, McpError> {
        let filter = params.0.name_filter.map(|f| f.to_lowercase());
        let processes: Vec<_> = process::list_processes()
            .into_iter()
            .filter(|p| match &filter {
                Some(filter) => p.name.to_lowercase().contains(filter),
                None => true,
            })
            .collect();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "count": processes.len(),
            "processes": processes,
        })))
    }
}

#[tool_handler]
impl ServerHandler for CdbMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "MCP server exposing a native console debugger: attach/launch, \
                 breakpoints, stepping, stack and variable inspection, crash analysis"
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let server = CdbMcpServer::new();
    let transport = transport::stdio();

    tracing::info!("Starting cdb MCP server on stdio...");

    server.serve(transport).await?.waiting().await?;

    Ok(())
}
