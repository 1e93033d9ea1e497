//! MCP server implementation

use crate::config::{Config, Transport};
use crate::connection::ConnectionDescriptorBuilder;
use crate::credential::CredentialResolver;
use crate::format::{PayloadShape, ResultFormatter};
use crate::management::{FlexibleServerClient, ServerConfiguration, ServerManagement};
use crate::query::{QueryOutcome, StatementExecutor, WriteOutcome};
use crate::{Result, ServerError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

/// Lists every column of every table in the `public` schema
pub const SCHEMA_QUERY: &str = "SELECT table_name, column_name, data_type FROM information_schema.columns \
     WHERE table_schema = 'public' ORDER BY table_name, ordinal_position;";

/// Lists every non-template database
pub const DATABASES_QUERY: &str = "SELECT datname FROM pg_database WHERE datistemplate = false;";

/// Database used for server-wide listings
const MAINTENANCE_DATABASE: &str = "postgres";

const ENTRA_ONLY_MESSAGE: &str = "This tool is available only with Microsoft Entra ID authentication";

/// JSON-RPC request structure
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

/// JSON-RPC response structure
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error structure
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }
}

/// Arguments of `query_data`, `update_values`, `create_table` and `drop_table`
#[derive(Debug, Deserialize)]
struct SqlArguments {
    #[serde(default, alias = "dbname")]
    database: Option<String>,
    #[serde(alias = "s")]
    sql: String,
}

/// Arguments of `get_schemas`
#[derive(Debug, Default, Deserialize)]
struct DatabaseArguments {
    #[serde(default, alias = "dbname")]
    database: Option<String>,
}

/// Arguments of `get_server_parameter`
#[derive(Debug, Deserialize)]
struct ParameterArguments {
    #[serde(alias = "name")]
    parameter_name: String,
}

#[derive(Serialize)]
struct ServerConfigPayload<'a> {
    server: &'a ServerConfiguration,
}

/// MCP server for Azure Database for PostgreSQL flexible servers
#[derive(Clone)]
pub struct McpServer {
    config: Arc<Config>,
    connections: ConnectionDescriptorBuilder,
    management: Option<Arc<dyn ServerManagement>>,
    shape: PayloadShape,
}

impl McpServer {
    /// Create a server with the credential chain and management client the configuration asks for
    pub fn new(config: Config) -> Result<Self> {
        let resolver = CredentialResolver::from_config(&config)?;

        let management: Option<Arc<dyn ServerManagement>> = match resolver.token_credential() {
            Some(credential) => {
                let subscription_id = config.azure.subscription_id.clone().ok_or_else(|| {
                    ServerError::configuration_error(
                        "AZURE_SUBSCRIPTION_ID".to_string(),
                        "A subscription id is required with Entra ID authentication".to_string(),
                    )
                })?;
                let resource_group = config.azure.resource_group.clone().ok_or_else(|| {
                    ServerError::configuration_error(
                        "AZURE_RESOURCE_GROUP".to_string(),
                        "A resource group is required with Entra ID authentication".to_string(),
                    )
                })?;
                let client = FlexibleServerClient::new(
                    credential,
                    subscription_id,
                    resource_group,
                    config.database.server_name().to_string(),
                )?;
                Some(Arc::new(client))
            }
            None => None,
        };

        Ok(Self::with_components(config, resolver, management))
    }

    /// Create a server from explicit parts
    pub fn with_components(
        config: Config,
        resolver: CredentialResolver,
        management: Option<Arc<dyn ServerManagement>>,
    ) -> Self {
        let connections = ConnectionDescriptorBuilder::new(&config.database, resolver);
        let shape = match connections.default_database() {
            Some(_) => PayloadShape::Plain,
            None => PayloadShape::Structured,
        };

        Self {
            config: Arc::new(config),
            connections,
            management,
            shape,
        }
    }

    /// Get the server configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn payload_shape(&self) -> PayloadShape {
        self.shape
    }

    /// URI of the single published resource
    pub fn resource_uri(&self) -> String {
        let server_name = self.config.database.server_name();
        match self.connections.default_database() {
            Some(database) => format!("flexpg://{}/{}/tables", server_name, database),
            None => format!("flexpg://{}/databases", server_name),
        }
    }

    /// Check that a credential can be resolved before serving
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing Flexible Server MCP server");
        info!("Authentication mode: {:?}", self.connections.resolver().mode());
        info!("Resource published at {}", self.resource_uri());

        // A token is only needed per call, but a broken identity setup should fail at startup
        self.connections.resolver().resolve_credential().await?;

        info!("Flexible Server MCP server initialized successfully");
        Ok(())
    }

    /// Serve on the configured transport until it closes
    pub async fn start(&self) -> Result<()> {
        self.initialize().await?;

        match self.config.server.transport {
            Transport::Stdio => self.serve_stdio().await,
            Transport::Http => self.serve_http(self.config.server.port).await,
        }
    }

    /// Newline-delimited JSON-RPC on stdin/stdout; returns when stdin closes
    pub async fn serve_stdio(&self) -> Result<()> {
        info!("Serving MCP over stdio");

        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = LinesStream::new(stdin.lines());
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| ServerError::io_error(e, "reading stdin".to_string()))?;

            if let Some(response) = self.handle_message(&line).await {
                let output = serde_json::to_string(&response)
                    .map_err(|e| ServerError::serialization_error(e, "JSON-RPC response".to_string()))?;
                stdout.write_all(output.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }

        info!("stdin closed, stdio transport stopped");
        Ok(())
    }

    /// JSON-RPC over HTTP POST at /mcp
    pub async fn serve_http(&self, port: u16) -> Result<()> {
        use warp::Filter;

        let server_for_mcp = self.clone();
        let mcp_route = warp::path("mcp")
            .and(warp::post())
            .and(warp::body::json())
            .and_then(move |request: JsonRpcRequest| {
                let server = server_for_mcp.clone();
                async move {
                    let is_notification = request.id.is_none();
                    let response = server.handle_jsonrpc_request(request).await;

                    if is_notification {
                        Ok::<_, warp::Rejection>(warp::reply::with_status(
                            warp::reply::json(&json!({})),
                            warp::http::StatusCode::NO_CONTENT,
                        ))
                    } else {
                        Ok(warp::reply::with_status(
                            warp::reply::json(&response),
                            warp::http::StatusCode::OK,
                        ))
                    }
                }
            });

        let server_for_get = self.clone();
        let mcp_get_route = warp::path("mcp")
            .and(warp::get())
            .map(move || {
                warp::reply::json(&json!({
                    "jsonrpc": "2.0",
                    "result": server_for_get.server_info(),
                }))
            });

        let mcp_options = warp::path("mcp")
            .and(warp::options())
            .map(|| warp::reply::with_status("", warp::http::StatusCode::OK));

        let cors = warp::cors()
            .allow_any_origin()
            .allow_headers(vec!["content-type", "authorization", "x-requested-with", "accept"])
            .allow_methods(vec!["POST", "GET", "OPTIONS"])
            .expose_headers(vec!["content-type"]);

        let routes = mcp_route.or(mcp_get_route).or(mcp_options).with(cors);

        info!("MCP server listening on http://0.0.0.0:{}/mcp", port);

        warp::serve(routes).run(([0, 0, 0, 0], port)).await;

        info!("Server stopped");
        Ok(())
    }

    /// Shutdown the server gracefully
    pub async fn shutdown(&self) -> Result<()> {
        // Connections live only for the duration of a call, so nothing is left open here
        info!("Shutting down MCP server");
        Ok(())
    }

    /// Handle one raw JSON-RPC message; `None` when no response is due
    pub async fn handle_message(&self, line: &str) -> Option<JsonRpcResponse> {
        if line.trim().is_empty() {
            return None;
        }

        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                error!("Failed to parse JSON-RPC message: {}", e);
                return Some(JsonRpcResponse::failure(None, -32700, format!("Parse error: {}", e)));
            }
        };

        let is_notification = request.id.is_none();
        let response = self.handle_jsonrpc_request(request).await;

        if is_notification {
            None
        } else {
            Some(response)
        }
    }

    /// Handle JSON-RPC requests
    pub async fn handle_jsonrpc_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!("Handling JSON-RPC request: method={}, id={:?}", request.method, request.id);

        if request.id.is_none() {
            match request.method.as_str() {
                "notifications/initialized" => info!("Client initialized"),
                other => debug!("Ignoring notification {}", other),
            }
            return JsonRpcResponse::success(None, json!({}));
        }

        let result = match request.method.as_str() {
            "initialize" => Ok(self.handle_initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.handle_list_tools()),
            "tools/call" => self.handle_call_tool(request.params).await,
            "resources/list" => Ok(self.handle_list_resources()),
            "resources/read" => self.handle_read_resource(request.params).await,
            _ => Err(ServerError::protocol_error(
                format!("Unknown method: {}", request.method),
                request.id.as_ref().map(|v| v.to_string()),
            )),
        };

        match result {
            Ok(result_value) => JsonRpcResponse::success(request.id, result_value),
            Err(e) => {
                error!("JSON-RPC request failed: {}", e.detailed_message());

                let error_code = match &e {
                    ServerError::Protocol { .. } => -32601, // Method not found
                    ServerError::Validation { .. } => -32602, // Invalid params
                    _ => -32603, // Internal error
                };

                JsonRpcResponse::failure(request.id, error_code, e.user_message())
            }
        }
    }

    fn server_info(&self) -> Value {
        json!({
            "protocolVersion": self.config.mcp.protocol_version,
            "capabilities": {
                "tools": {},
                "resources": {}
            },
            "serverInfo": {
                "name": self.config.mcp.server_name,
                "version": self.config.mcp.server_version
            }
        })
    }

    /// Handle initialize request
    pub fn handle_initialize(&self) -> Value {
        info!("Handling initialize request");
        self.server_info()
    }

    /// Handle list tools request
    pub fn handle_list_tools(&self) -> Value {
        let database_required = self.connections.default_database().is_none();
        let database_description = if database_required {
            "Database to run the statement in"
        } else {
            "Database to run the statement in (defaults to the configured database)"
        };

        let sql_schema = |sql_description: &str| {
            let required = if database_required {
                json!(["database", "sql"])
            } else {
                json!(["sql"])
            };
            json!({
                "type": "object",
                "properties": {
                    "database": {
                        "type": "string",
                        "description": database_description
                    },
                    "sql": {
                        "type": "string",
                        "description": sql_description
                    }
                },
                "required": required
            })
        };

        let schemas_required = if database_required { json!(["database"]) } else { json!([]) };

        json!({
            "tools": [
                {
                    "name": "query_data",
                    "description": "Runs read queries on a database.",
                    "inputSchema": sql_schema("SQL query to run")
                },
                {
                    "name": "update_values",
                    "description": "Updates or inserts values into a table.",
                    "inputSchema": sql_schema("INSERT, UPDATE or DELETE statement to run and commit")
                },
                {
                    "name": "create_table",
                    "description": "Creates a table in a database.",
                    "inputSchema": sql_schema("CREATE TABLE statement to run and commit")
                },
                {
                    "name": "drop_table",
                    "description": "Drops a table in a database.",
                    "inputSchema": sql_schema("DROP TABLE statement to run and commit")
                },
                {
                    "name": "get_databases",
                    "description": "Gets the list of all the databases in a server instance.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {}
                    }
                },
                {
                    "name": "get_schemas",
                    "description": "Gets schemas of all the tables.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "database": {
                                "type": "string",
                                "description": database_description
                            }
                        },
                        "required": schemas_required
                    }
                },
                {
                    "name": "get_server_config",
                    "description": "Gets the configuration of a server instance. [Available with Microsoft Entra ID]",
                    "inputSchema": {
                        "type": "object",
                        "properties": {}
                    }
                },
                {
                    "name": "get_server_parameter",
                    "description": "Gets the value of a server parameter. [Available with Microsoft Entra ID]",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "parameter_name": {
                                "type": "string",
                                "description": "Name of the server parameter, e.g. max_connections"
                            }
                        },
                        "required": ["parameter_name"]
                    }
                }
            ]
        })
    }

    /// Handle call tool request
    pub async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value> {
        let params = params.ok_or_else(|| {
            ServerError::validation_error("Missing parameters for tool call".to_string(), None)
        })?;

        let tool_name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ServerError::validation_error(
                    "Missing tool name".to_string(),
                    Some("name field not found or not a string".to_string()),
                )
            })?;

        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        debug!("Calling tool: {} with arguments: {}", tool_name, arguments);

        let result = match tool_name {
            "query_data" => {
                let args: SqlArguments = parse_arguments(tool_name, arguments)?;
                text_content(self.query_data(args.database.as_deref(), &args.sql).await?)
            }
            "update_values" | "create_table" | "drop_table" => {
                let args: SqlArguments = parse_arguments(tool_name, arguments)?;
                self.execute_write(args.database.as_deref(), &args.sql).await?;
                empty_content()
            }
            "get_databases" => text_content(self.get_databases().await),
            "get_schemas" => {
                let args: DatabaseArguments = parse_arguments(tool_name, arguments)?;
                text_content(self.get_schemas(args.database.as_deref()).await?)
            }
            "get_server_config" => tool_result(self.get_server_config().await)?,
            "get_server_parameter" => {
                let args: ParameterArguments = parse_arguments(tool_name, arguments)?;
                tool_result(self.get_server_parameter(&args.parameter_name).await)?
            }
            _ => {
                return Err(ServerError::validation_error(
                    format!("Unknown tool: {}", tool_name),
                    Some(tool_name.to_string()),
                ));
            }
        };

        Ok(result)
    }

    /// Handle list resources request
    pub fn handle_list_resources(&self) -> Value {
        let (name, description) = match self.connections.default_database() {
            Some(_) => ("tables", "Schema of every table in the public schema"),
            None => ("databases", "List of all databases in the server instance"),
        };

        json!({
            "resources": [
                {
                    "uri": self.resource_uri(),
                    "name": name,
                    "description": description,
                    "mimeType": "text/plain"
                }
            ]
        })
    }

    /// Handle read resource request
    pub async fn handle_read_resource(&self, params: Option<Value>) -> Result<Value> {
        let uri = params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServerError::validation_error("Missing uri".to_string(), None))?
            .to_string();

        let text = self.read_resource(&uri).await?;

        Ok(json!({
            "contents": [
                {
                    "uri": uri,
                    "mimeType": "text/plain",
                    "text": text
                }
            ]
        }))
    }

    /// Content of the published resource
    pub async fn read_resource(&self, uri: &str) -> Result<String> {
        if uri != self.resource_uri() {
            return Err(ServerError::validation_error(
                format!("Unknown resource: {}", uri),
                Some(uri.to_string()),
            ));
        }

        match self.connections.default_database() {
            Some(_) => self.get_schemas(None).await,
            None => Ok(self.get_databases().await),
        }
    }

    /// Run a read and render it; empty string when it fails
    pub async fn query_data(&self, database: Option<&str>, sql: &str) -> Result<String> {
        let database = self.connections.database_or_default(database)?;
        let outcome = self.run_query(database, sql).await;
        Ok(outcome.render(&ResultFormatter::for_query(self.shape)))
    }

    /// Run a read against `database`, keeping failures visible as [`QueryOutcome::Failed`]
    pub async fn run_query(&self, database: &str, sql: &str) -> QueryOutcome {
        match self.connections.build_target(database).await {
            Ok(target) => StatementExecutor::run_query(&target, sql).await,
            Err(e) => QueryOutcome::Failed { reason: e.user_message() },
        }
    }

    /// Execute and commit a statement; failures are logged, never returned
    pub async fn execute_write(&self, database: Option<&str>, sql: &str) -> Result<WriteOutcome> {
        let database = self.connections.database_or_default(database)?;

        let outcome = match self.connections.build_target(database).await {
            Ok(target) => StatementExecutor::run_write(&target, sql).await,
            Err(e) => WriteOutcome::Failed { reason: e.user_message() },
        };

        Ok(outcome)
    }

    pub async fn update_values(&self, database: Option<&str>, sql: &str) -> Result<WriteOutcome> {
        self.execute_write(database, sql).await
    }

    pub async fn create_table(&self, database: Option<&str>, sql: &str) -> Result<WriteOutcome> {
        self.execute_write(database, sql).await
    }

    pub async fn drop_table(&self, database: Option<&str>, sql: &str) -> Result<WriteOutcome> {
        self.execute_write(database, sql).await
    }

    /// Non-template databases on the server
    pub async fn get_databases(&self) -> String {
        self.run_query(MAINTENANCE_DATABASE, DATABASES_QUERY)
            .await
            .render(&ResultFormatter::for_listing(self.shape))
    }

    /// Table, column and type of every column in the public schema
    pub async fn get_schemas(&self, database: Option<&str>) -> Result<String> {
        let database = self.connections.database_or_default(database)?;

        Ok(self
            .run_query(database, SCHEMA_QUERY)
            .await
            .render(&ResultFormatter::for_listing(self.shape)))
    }

    /// Server summary from the management plane; `None` if the call failed
    pub async fn get_server_config(&self) -> Result<Option<String>> {
        let management = self.management("get_server_config")?;

        let server = match management.get_server().await {
            Ok(server) => server,
            Err(_) => return Ok(None),
        };

        let payload = serde_json::to_string(&ServerConfigPayload { server: &server })
            .map_err(|e| ServerError::serialization_error(e, "server configuration".to_string()))?;
        Ok(Some(payload))
    }

    /// One server parameter from the management plane; `None` if the call failed
    pub async fn get_server_parameter(&self, parameter_name: &str) -> Result<Option<String>> {
        let management = self.management("get_server_parameter")?;

        let parameter = match management.get_parameter(parameter_name).await {
            Ok(parameter) => parameter,
            Err(_) => return Ok(None),
        };

        let payload = serde_json::to_string(&parameter)
            .map_err(|e| ServerError::serialization_error(e, "server parameter".to_string()))?;
        Ok(Some(payload))
    }

    fn management(&self, operation: &str) -> Result<&Arc<dyn ServerManagement>> {
        self.management.as_ref().ok_or_else(|| {
            ServerError::unsupported_operation(operation.to_string(), ENTRA_ONLY_MESSAGE.to_string())
        })
    }
}

fn parse_arguments<T: DeserializeOwned>(tool_name: &str, arguments: Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| {
        ServerError::validation_error(
            format!("Invalid arguments for {}: {}", tool_name, e),
            None,
        )
    })
}

fn text_content(text: String) -> Value {
    json!({
        "content": [
            {
                "type": "text",
                "text": text
            }
        ]
    })
}

fn empty_content() -> Value {
    json!({ "content": [] })
}

/// Unsupported operations become tool errors; other errors stay protocol errors
fn tool_result(result: Result<Option<String>>) -> Result<Value> {
    match result {
        Ok(Some(payload)) => Ok(text_content(payload)),
        Ok(None) => Ok(empty_content()),
        Err(e @ ServerError::Unsupported { .. }) => Ok(json!({
            "content": [
                {
                    "type": "text",
                    "text": e.user_message()
                }
            ],
            "isError": true
        })),
        Err(e) => Err(e),
    }
}
