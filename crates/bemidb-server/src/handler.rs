//! pgwire handlers: startup/auth, simple and extended query protocol,
//! bridged to the query engine.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bemidb_core::{BemiError, Config};
use futures::sink::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DescribePortalResponse, DescribeResponse, DescribeStatementResponse, FieldInfo, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use tracing::debug;

use crate::catalog;
use crate::encode;
use crate::engine::QueryEngine;

const SERVER_VERSION: &str = "16.6";

/// Map an engine error onto a protocol error with the matching SQLSTATE.
pub fn api_error(e: anyhow::Error) -> PgWireError {
    let code = match e.downcast_ref::<BemiError>() {
        Some(BemiError::ReadOnlyViolation) => "25006",
        Some(BemiError::QueryCanceled) => "57014",
        Some(BemiError::NotFound(_)) => "42P01",
        Some(BemiError::CatalogUnavailable(_)) | Some(BemiError::ObjectStore(_)) => "58000",
        _ => "XX000",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".to_string(),
        code.to_string(),
        format!("{e:#}"),
    )))
}

/// Per-connection handler. Sessions share nothing: prepared statements and
/// portals live in the client's portal store, query state in the engine
/// call itself.
pub struct BemiHandler {
    engine: Arc<QueryEngine>,
}

impl BemiHandler {
    async fn execute_sql(&self, sql: &str) -> PgWireResult<Vec<Response>> {
        debug!(query = sql, "executing");
        if let Some(responses) = catalog::try_system_response(sql, &self.engine).await? {
            return Ok(responses);
        }
        let stream = self.engine.execute(sql).await.map_err(api_error)?;
        Ok(vec![Response::Query(encode::stream_response(stream))])
    }

    async fn describe_fields(&self, sql: &str) -> PgWireResult<Vec<FieldInfo>> {
        if catalog::is_system_query(sql) {
            // Lazy: clients tolerate NoData for the built-in answers.
            return Ok(vec![]);
        }
        let schema = self.engine.describe(sql).await.map_err(api_error)?;
        Ok(encode::field_infos(&schema))
    }
}

#[async_trait]
impl SimpleQueryHandler for BemiHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        self.execute_sql(query).await
    }
}

/// Extended-protocol statements keep the raw SQL; the engine parses during
/// planning.
pub struct BemiQueryParser;

#[async_trait]
impl QueryParser for BemiQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, _stmt: &String) -> PgWireResult<Vec<Type>> {
        // Bound parameters are not supported; clients inline values.
        Ok(vec![])
    }

    fn get_result_schema(
        &self,
        _stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        // Resolved in do_describe_statement, where the engine is at hand.
        Ok(vec![])
    }
}

#[async_trait]
impl ExtendedQueryHandler for BemiHandler {
    type Statement = String;
    type QueryParser = BemiQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        Arc::new(BemiQueryParser)
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<String>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = String>,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        let sql = portal.statement.statement.as_str();
        let mut responses = self.execute_sql(sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        statement: &StoredStatement<String>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = String>,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        let fields = self.describe_fields(&statement.statement).await?;
        Ok(DescribeStatementResponse::new(vec![], fields))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        portal: &Portal<String>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = String>,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        let fields = self.describe_fields(&portal.statement.statement).await?;
        if fields.is_empty() {
            Ok(DescribePortalResponse::no_data())
        } else {
            Ok(DescribePortalResponse::new(fields))
        }
    }
}

fn server_parameters() -> DefaultServerParameterProvider {
    let mut params = DefaultServerParameterProvider::default();
    params.server_version = SERVER_VERSION.to_string();
    params.date_style = "ISO, MDY".to_string();
    params
}

/// Trust authentication: negotiate, record startup parameters, done.
pub struct TrustStartupHandler;

#[async_trait]
impl StartupHandler for TrustStartupHandler {
    async fn on_startup<C>(&self, client: &mut C, message: PgWireFrontendMessage) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        if let PgWireFrontendMessage::Startup(ref startup) = message {
            pgwire::api::auth::protocol_negotiation(client, startup).await?;
            pgwire::api::auth::save_startup_parameters_to_metadata(client, startup);
            pgwire::api::auth::finish_authentication(client, &server_parameters()).await?;
        }
        Ok(())
    }
}

/// Credential source for cleartext password authentication.
#[derive(Debug)]
pub struct ConfiguredAuthSource {
    user: String,
    password: String,
}

#[async_trait]
impl AuthSource for ConfiguredAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user_matches = login.user().map(|u| u.to_string() == self.user).unwrap_or(false);
        if !user_matches {
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".to_string(),
                "28P01".to_string(),
                "password authentication failed".to_string(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Startup handling per configuration: trust, or cleartext password.
pub enum BemiStartupHandler {
    Trust(TrustStartupHandler),
    Password(CleartextPasswordAuthStartupHandler<ConfiguredAuthSource, DefaultServerParameterProvider>),
}

#[async_trait]
impl StartupHandler for BemiStartupHandler {
    async fn on_startup<C>(&self, client: &mut C, message: PgWireFrontendMessage) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match self {
            BemiStartupHandler::Trust(handler) => handler.on_startup(client, message).await,
            BemiStartupHandler::Password(handler) => handler.on_startup(client, message).await,
        }
    }
}

/// Per-connection handler factory shared by the accept loop.
#[derive(Clone)]
pub struct BemiHandlerFactory {
    engine: Arc<QueryEngine>,
    config: Arc<Config>,
}

impl BemiHandlerFactory {
    pub fn new(engine: Arc<QueryEngine>, config: Arc<Config>) -> Self {
        Self { engine, config }
    }

    fn make_handler(&self) -> BemiHandler {
        BemiHandler { engine: self.engine.clone() }
    }
}

impl PgWireServerHandlers for BemiHandlerFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        Arc::new(self.make_handler())
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        Arc::new(self.make_handler())
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        let handler = match (&self.config.user, &self.config.password) {
            (Some(user), Some(password)) => {
                BemiStartupHandler::Password(CleartextPasswordAuthStartupHandler::new(
                    ConfiguredAuthSource { user: user.clone(), password: password.clone() },
                    server_parameters(),
                ))
            }
            _ => BemiStartupHandler::Trust(TrustStartupHandler),
        };
        Arc::new(handler)
    }
}
