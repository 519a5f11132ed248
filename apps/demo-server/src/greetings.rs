//! A toy execution engine: one subscription and one query.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use graphwire_protocol::{ExecutionResult, GraphQlError, GraphQlRequest};
use graphwire_server::{ConnectionInfo, Execution, ExecutionGateway, GatewayError, GatewayFuture};
use serde_json::json;

const GREETINGS: [&str; 3] = ["Hi", "Bonjour", "Hola"];

pub struct GreetingsGateway {
    /// Pause between two greetings.
    pub interval: Duration,
}

impl Default for GreetingsGateway {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
        }
    }
}

impl ExecutionGateway for GreetingsGateway {
    fn execute(&self, info: Arc<ConnectionInfo>, request: GraphQlRequest) -> GatewayFuture<'_> {
        let interval = self.interval;
        Box::pin(async move {
            match normalize(&request.query).as_str() {
                "subscription { greetings }" => {
                    tracing::debug!(connection_id = %info.id, "greetings subscription");
                    let greetings = stream::iter(GREETINGS).then(move |greeting| async move {
                        tokio::time::sleep(interval).await;
                        Ok::<_, Vec<GraphQlError>>(ExecutionResult::data(
                            json!({ "greetings": greeting }),
                        ))
                    });
                    Ok(Execution::stream(greetings))
                }
                "{ hello }" | "query { hello }" => Ok(Execution::Single(ExecutionResult::data(
                    json!({ "hello": "world" }),
                ))),
                other => Err(GatewayError::message(format!(
                    "Cannot execute `{other}`: only `subscription {{ greetings }}` and `{{ hello }}` exist"
                ))),
            }
        })
    }
}

/// Collapses whitespace so formatting does not matter.
fn normalize(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> GreetingsGateway {
        GreetingsGateway {
            interval: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn greetings_stream() {
        let exec = gateway()
            .execute(
                Arc::new(ConnectionInfo::local()),
                GraphQlRequest::new("subscription {\n  greetings\n}"),
            )
            .await
            .unwrap();
        let Execution::Stream(stream) = exec else {
            panic!("expected a stream");
        };
        let items: Vec<_> = stream.collect().await;
        let greetings: Vec<_> = items
            .into_iter()
            .map(|r| r.unwrap().data.unwrap()["greetings"].clone())
            .collect();
        assert_eq!(greetings, vec!["Hi", "Bonjour", "Hola"]);
    }

    #[tokio::test]
    async fn hello_is_single() {
        let exec = gateway()
            .execute(Arc::new(ConnectionInfo::local()), GraphQlRequest::new("{ hello }"))
            .await
            .unwrap();
        let Execution::Single(result) = exec else {
            panic!("expected a single result");
        };
        assert_eq!(result.data, Some(json!({ "hello": "world" })));
    }

    #[tokio::test]
    async fn anything_else_is_rejected() {
        let err = gateway()
            .execute(Arc::new(ConnectionInfo::local()), GraphQlRequest::new("{ nope }"))
            .await
            .unwrap_err();
        assert!(err.errors[0].message.contains("{ nope }"));
    }
}
