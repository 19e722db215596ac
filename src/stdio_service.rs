use rmcp::{model::*, ServiceExt};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{error, info};

use crate::types::{CompareRequest, CompareResponse};
use crate::{AppState, GatewayConfig};

const TOOL_NAME: &str = "compare_listing";
const MCP_CLIENT: &str = "mcp-stdio";

#[derive(Clone)]
pub struct McpService {
    pub state: Arc<AppState>,
}

impl McpService {
    pub fn new() -> anyhow::Result<Self> {
        // stdout carries the protocol, so logs go to stderr
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();

        let config = GatewayConfig::from_env()?;
        info!("Starting MCP Service");
        info!("Search upstream: {}", config.upstream.search_url);

        Ok(Self::with_state(Arc::new(AppState::from_config(config)?)))
    }

    pub fn with_state(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Input schema of the tool, derived from the request type.
    fn input_schema() -> Arc<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(schemars::schema_for!(CompareRequest)) {
            Ok(serde_json::Value::Object(map)) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        }
    }

    pub fn tool() -> Tool {
        Tool {
            name: Cow::Borrowed(TOOL_NAME),
            description: Some(Cow::Borrowed("Price a listing against recent sold comparables. Returns the median market price, margin against the buy price, a PASS/FAIL verdict, a confidence tier and cache/quota provenance.")),
            input_schema: Self::input_schema(),
            output_schema: None,
            annotations: None,
        }
    }

    /// Runs one comparison on behalf of an MCP client.
    pub async fn compare(&self, arguments: Option<JsonObject>) -> Result<CompareResponse, ErrorData> {
        let args = arguments.ok_or_else(|| {
            ErrorData::new(
                ErrorCode::INVALID_PARAMS,
                "Missing required arguments object",
                None,
            )
        })?;
        let mut request: CompareRequest = serde_json::from_value(serde_json::Value::Object(args))
            .map_err(|e| ErrorData::new(ErrorCode::INVALID_PARAMS, format!("Invalid arguments: {}", e), None))?;
        if request.client_id.as_deref().map_or(true, |c| c.trim().is_empty()) {
            request.client_id = Some(MCP_CLIENT.to_string());
        }
        Ok(self.state.gateway.compare(&request).await)
    }
}

/// Human-readable summary followed by the full structured response.
pub fn render(response: &CompareResponse) -> String {
    let json = serde_json::to_string_pretty(response).unwrap_or_default();
    match &response.result {
        Some(result) => format!(
            "**{:?}** ({:?} confidence)\n\nMarket price: {:.2}\nBuy price: {:.2}\nMargin: {:.1}%\n{}\n\n```json\n{}\n```",
            result.verdict,
            result.confidence,
            result.market_price,
            result.buy_price,
            result.margin_pct,
            result.why,
            json
        ),
        None => format!(
            "Comparison failed: {}\n\n```json\n{}\n```",
            response.message.as_deref().unwrap_or("unknown error"),
            json
        ),
    }
}

impl rmcp::ServerHandler for McpService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            server_info: Implementation {
                name: "comps-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "Prices second-hand listings against sold comparables through a rate-limited, cached gateway. Respect retryAfterSec when a call is refused.".to_string(),
            ),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _page: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: vec![Self::tool()],
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        info!("MCP tool call: {} with args: {:?}", request.name, request.arguments);

        match request.name.as_ref() {
            TOOL_NAME => {
                let response = self.compare(request.arguments).await?;
                let text = render(&response);
                if response.ok {
                    Ok(CallToolResult::success(vec![Content::text(text)]))
                } else {
                    error!("Compare tool error: {:?}", response.message);
                    Ok(CallToolResult::error(vec![Content::text(text)]))
                }
            }
            _ => Err(ErrorData::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("Unknown tool: {}", request.name),
                None,
            )),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    let service = McpService::new()?;
    // Use the stdio transport from rmcp
    let server = service.serve(rmcp::transport::stdio()).await?;
    info!("MCP stdio server running");
    let _quit_reason = server.waiting().await?;
    Ok(())
}
