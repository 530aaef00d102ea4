//! Batched transactions
//!
//! A batch is approved once for the union of its canisters and then runs
//! strictly in order. Later transactions can build their arguments from
//! what earlier ones returned. The first failure halts the batch; calls
//! that already went through are not compensated.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rand::RngCore;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agent::{Agent, ArgDecoder, BridgeAgent, CallOptions, QueryFields, QueryResponse};
use crate::auth::SignInfo;
use crate::crypto::Principal;
use crate::error::{BridgeError, BridgeResult};
use crate::session::SessionManager;
use crate::transport::{decode_bytes, Command, RpcClient};

/// Typed interface of a canister
///
/// Stands in for the interface description language: arguments are
/// handled as JSON values and encoded by the implementation.
pub trait CanisterInterface: ArgDecoder {
    /// Encode positional arguments of a method
    fn encode_args(&self, method_name: &str, args: &[Value]) -> BridgeResult<Vec<u8>>;

    /// Decode the reply of a method
    fn decode_reply(&self, method_name: &str, reply: &[u8]) -> BridgeResult<Value>;

    /// Whether a method is a query
    fn is_query(&self, _method_name: &str) -> bool {
        false
    }
}

/// Response of an earlier transaction, as kept by its `on_success`
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionPrevResponse {
    /// Position of the transaction in the batch
    pub index: usize,
    /// Value returned by `on_success`
    pub response: Value,
}

type ChainFn = dyn Fn(&[TransactionPrevResponse]) -> BridgeResult<Vec<Value>> + Send + Sync;
type SuccessFn = dyn Fn(Value) -> BoxFuture<'static, Option<Value>> + Send + Sync;
type FailFn = dyn Fn(BridgeError, Vec<TransactionPrevResponse>) -> BoxFuture<'static, ()> + Send + Sync;

/// Arguments of a transaction
pub enum TransactionArgs {
    /// Used verbatim
    Fixed(Vec<Value>),
    /// Built from the responses accumulated so far
    Chained(Box<ChainFn>),
}

impl TransactionArgs {
    fn resolve(&self, prev: &[TransactionPrevResponse]) -> BridgeResult<Vec<Value>> {
        match self {
            TransactionArgs::Fixed(args) => Ok(args.clone()),
            TransactionArgs::Chained(build) => build(prev),
        }
    }
}

/// One call of a batch
pub struct Transaction {
    canister_id: String,
    method_name: String,
    interface: Arc<dyn CanisterInterface>,
    args: TransactionArgs,
    on_success: Option<Box<SuccessFn>>,
    on_fail: Option<Box<FailFn>>,
}

impl Transaction {
    /// Call `method_name` on `canister_id` with no arguments
    pub fn new(
        canister_id: impl Into<String>,
        method_name: impl Into<String>,
        interface: Arc<dyn CanisterInterface>,
    ) -> Self {
        Transaction {
            canister_id: canister_id.into(),
            method_name: method_name.into(),
            interface,
            args: TransactionArgs::Fixed(Vec::new()),
            on_success: None,
            on_fail: None,
        }
    }

    /// Fixed arguments
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = TransactionArgs::Fixed(args);
        self
    }

    /// Arguments built from earlier responses
    pub fn chained_args<F>(mut self, build: F) -> Self
    where
        F: Fn(&[TransactionPrevResponse]) -> BridgeResult<Vec<Value>> + Send + Sync + 'static,
    {
        self.args = TransactionArgs::Chained(Box::new(build));
        self
    }

    /// Handler for the decoded response
    ///
    /// A returned value is passed on to later transactions unless it is
    /// `None` or an empty value: `null`, `false`, `0` or `""`.
    pub fn on_success<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        self.on_success = Some(Box::new(move |response| Box::pin(handler(response))));
        self
    }

    /// Handler for the failure that halts the batch
    pub fn on_fail<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(BridgeError, Vec<TransactionPrevResponse>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_fail = Some(Box::new(move |error, prev| Box::pin(handler(error, prev))));
        self
    }

    /// Target canister
    pub fn canister_id(&self) -> &str {
        &self.canister_id
    }

    /// Approval prompt entry
    ///
    /// Chained arguments are unknown until the batch runs, so they are
    /// shown empty. Fixed arguments that fail to encode fail the batch
    /// before it is offered for approval.
    fn sign_info(&self, sender: &Principal) -> BridgeResult<SignInfo> {
        match &self.args {
            TransactionArgs::Fixed(args) => {
                let encoded = self.interface.encode_args(&self.method_name, args)?;
                Ok(SignInfo::for_transaction(
                    &self.canister_id,
                    &self.method_name,
                    sender,
                    &encoded,
                    Some(Value::Array(args.clone())),
                ))
            }
            TransactionArgs::Chained(_) => Ok(SignInfo::for_transaction(
                &self.canister_id,
                &self.method_name,
                sender,
                &[],
                None,
            )),
        }
    }

    async fn run(&self, agent: &BridgeAgent, args: Vec<Value>) -> BridgeResult<Value> {
        let canister_id = Principal::from_text(&self.canister_id)?;
        let arg = self.interface.encode_args(&self.method_name, &args)?;

        if self.interface.is_query(&self.method_name) {
            let fields = QueryFields {
                method_name: self.method_name.clone(),
                arg,
            };
            return match agent.query(&canister_id, fields).await? {
                QueryResponse::Replied { arg } => {
                    self.interface.decode_reply(&self.method_name, &arg)
                }
                QueryResponse::Rejected { reject_message, .. } => {
                    Err(BridgeError::RemoteCall(reject_message))
                }
            };
        }

        let options = CallOptions {
            method_name: self.method_name.clone(),
            arg,
            effective_canister_id: None,
        };
        let submitted = agent.call(&canister_id, options).await?;
        match submitted.response.pointer("/reply/arg") {
            Some(reply) => {
                let reply = decode_bytes(reply, "reply.arg")?;
                self.interface.decode_reply(&self.method_name, &reply)
            }
            None => Ok(submitted.response),
        }
    }
}

/// How a batch ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The user refused the batch; nothing ran
    Rejected,
    /// Every transaction succeeded
    Completed,
    /// The transaction at `index` failed and the rest did not run
    Halted {
        /// Failed transaction
        index: usize,
    },
}

impl BatchOutcome {
    /// Whether every transaction succeeded
    pub fn succeeded(&self) -> bool {
        matches!(self, BatchOutcome::Completed)
    }
}

/// Runs batches against the current session
pub struct BatchExecutor<'a> {
    sessions: &'a SessionManager,
    rpc: &'a RpcClient,
}

/// Whether an `on_success` result carries nothing worth chaining
fn is_empty_response(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) | Value::Bool(true) => false,
    }
}

/// Batch token from the authority's approval answer
fn batch_token(answer: &Value) -> Option<String> {
    match answer {
        Value::Bool(true) => {
            let mut id = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut id);
            Some(hex::encode(id))
        }
        Value::String(token) if !token.is_empty() => Some(token.clone()),
        Value::Object(fields) => {
            if fields.get("accepted").and_then(Value::as_bool) == Some(false) {
                return None;
            }
            fields
                .get("batchTxId")
                .and_then(Value::as_str)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
        }
        _ => None,
    }
}

impl<'a> BatchExecutor<'a> {
    /// Executor over a session manager and its client
    pub fn new(sessions: &'a SessionManager, rpc: &'a RpcClient) -> Self {
        BatchExecutor { sessions, rpc }
    }

    /// Approve and run a batch
    ///
    /// Failures inside the batch go to the failing transaction's
    /// `on_fail` and show up as [`BatchOutcome::Halted`]; only failures to
    /// set the batch up are returned as errors.
    pub async fn execute(&self, transactions: Vec<Transaction>) -> BridgeResult<BatchOutcome> {
        let canisters: BTreeSet<&str> = transactions.iter().map(|t| t.canister_id()).collect();

        let session = match self.sessions.extend_whitelist(canisters.iter().copied()).await {
            Ok(session) => session,
            Err(e) if e.is_user_rejection() => {
                info!("batch whitelist refused");
                return Ok(BatchOutcome::Rejected);
            }
            Err(e) => return Err(e),
        };

        let sign_infos = transactions
            .iter()
            .map(|t| t.sign_info(&session.principal))
            .collect::<BridgeResult<Vec<_>>>()?;
        let answer = self
            .rpc
            .call(Command::BatchTransactions {
                metadata: self.rpc.metadata().clone(),
                sign_infos,
            })
            .await;
        let token = match answer {
            Ok(answer) => batch_token(&answer),
            Err(e) if e.is_user_rejection() => None,
            Err(e) => return Err(e),
        };
        let Some(token) = token else {
            info!(transactions = transactions.len(), "batch refused");
            return Ok(BatchOutcome::Rejected);
        };

        let agent = session.agent.with_batch_token(token);
        let mut prev: Vec<TransactionPrevResponse> = Vec::new();

        for (index, transaction) in transactions.iter().enumerate() {
            debug!(
                index,
                canister_id = %transaction.canister_id,
                method = %transaction.method_name,
                "running batch transaction"
            );

            let result = match transaction.args.resolve(&prev) {
                Ok(args) => transaction.run(&agent, args).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(response) => {
                    if let Some(on_success) = &transaction.on_success {
                        if let Some(chained) = on_success(response).await {
                            if !is_empty_response(&chained) {
                                prev.push(TransactionPrevResponse {
                                    index,
                                    response: chained,
                                });
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(index, error = %e, "batch halted");
                    if let Some(on_fail) = &transaction.on_fail {
                        on_fail(e, prev.clone()).await;
                    }
                    return Ok(BatchOutcome::Halted { index });
                }
            }
        }

        info!(transactions = transactions.len(), "batch completed");
        Ok(BatchOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::InterfaceRegistry;
    use crate::config::DomainMetadata;
    use crate::session::ConnectParams;
    use crate::transport::memory::{self, DispatchLog, Scripted};
    use crate::transport::{encode_bytes, TransportError};
    use serde_json::json;
    use std::sync::Mutex;

    const A: &str = "ryjl3-tyaaa-aaaaa-aaaba-cai";
    const B: &str = "rrkah-fqaaa-aaaaa-aaaaq-cai";

    /// Arguments and replies as JSON text
    struct JsonInterface;

    impl ArgDecoder for JsonInterface {
        fn decode_args(&self, _method_name: &str, arg: &[u8]) -> Option<Value> {
            serde_json::from_slice(arg).ok()
        }
    }

    impl CanisterInterface for JsonInterface {
        fn encode_args(&self, _method_name: &str, args: &[Value]) -> BridgeResult<Vec<u8>> {
            Ok(serde_json::to_vec(args)?)
        }

        fn decode_reply(&self, _method_name: &str, reply: &[u8]) -> BridgeResult<Value> {
            Ok(serde_json::from_slice(reply)?)
        }

        fn is_query(&self, method_name: &str) -> bool {
            method_name == "balance"
        }
    }

    fn interface() -> Arc<dyn CanisterInterface> {
        Arc::new(JsonInterface)
    }

    fn reply(value: Value) -> Scripted {
        json!({
            "requestId": encode_bytes(&[1u8; 32]),
            "reply": {"arg": encode_bytes(&serde_json::to_vec(&value).unwrap())}
        })
        .into()
    }

    async fn connected<F>(script: F) -> (SessionManager, RpcClient, DispatchLog)
    where
        F: FnMut(&Command) -> Scripted + Send + 'static,
    {
        let (transport, authority) = memory::create_pair();
        let log = transport.dispatch_log();
        let rpc = RpcClient::new(
            Arc::new(transport),
            DomainMetadata::new("https://dapp.test", "Dapp"),
        );
        let mut script = script;
        authority.serve(move |cmd| match cmd {
            Command::RequestConnect { .. } | Command::VerifyWhitelist { .. } => {
                json!(hex::encode([3u8; 32])).into()
            }
            other => script(other),
        });

        let sessions = SessionManager::new(rpc.clone(), InterfaceRegistry::default());
        sessions
            .request_connect(ConnectParams {
                whitelist: vec![A.to_string()],
                ..ConnectParams::default()
            })
            .await
            .unwrap();
        (sessions, rpc, log)
    }

    #[tokio::test]
    async fn test_chained_args_receive_prior_response() {
        let (sessions, rpc, log) = connected(|cmd| match cmd {
            Command::BatchTransactions { .. } => json!({"batchTxId": "b-1"}).into(),
            Command::RequestCall { .. } => reply(json!({"ok": true})),
            _ => TransportError::InvalidData("unexpected".into()).into(),
        })
        .await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_chain = seen.clone();
        let transactions = vec![
            Transaction::new(A, "mint", interface())
                .args(vec![json!(10)])
                .on_success(|_| async { Some(json!({"x": 1})) }),
            Transaction::new(B, "stake", interface()).chained_args(move |prev| {
                let x = prev[0].response["x"].clone();
                seen_in_chain.lock().unwrap().push(x.clone());
                Ok(vec![x])
            }),
        ];

        let outcome = BatchExecutor::new(&sessions, &rpc)
            .execute(transactions)
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Completed);
        assert!(outcome.succeeded());
        assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
        assert_eq!(
            log.methods(),
            vec![
                "requestConnect",
                "verifyWhitelist",
                "batchTransactions",
                "requestCall",
                "requestCall"
            ]
        );

        let commands = log.commands();
        let Command::RequestCall {
            call, batch_tx_id, ..
        } = &commands[4]
        else {
            panic!("expected requestCall");
        };
        assert_eq!(call.canister_id, B);
        assert_eq!(call.arg, encode_bytes(b"[1]"));
        assert_eq!(batch_tx_id.as_deref(), Some("b-1"));
    }

    #[tokio::test]
    async fn test_failure_halts_batch() {
        let (sessions, rpc, log) = connected(|cmd| match cmd {
            Command::BatchTransactions { .. } => json!(true).into(),
            Command::RequestCall { .. } => TransportError::Remote {
                code: -32000,
                message: "Canister trapped".into(),
            }
            .into(),
            _ => TransportError::InvalidData("unexpected".into()).into(),
        })
        .await;

        let failures = Arc::new(Mutex::new(Vec::new()));
        let recorded = failures.clone();
        let transactions = vec![
            Transaction::new(A, "mint", interface()).on_fail(move |err, prev| {
                recorded.lock().unwrap().push((err, prev.len()));
                async {}
            }),
            Transaction::new(A, "stake", interface()),
        ];

        let outcome = BatchExecutor::new(&sessions, &rpc)
            .execute(transactions)
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Halted { index: 0 });
        assert!(!outcome.succeeded());
        assert_eq!(
            *failures.lock().unwrap(),
            vec![(BridgeError::RemoteCall("Canister trapped".into()), 0)]
        );
        let calls = log
            .methods()
            .into_iter()
            .filter(|m| *m == "requestCall")
            .count();
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_invalid_chained_args_halt() {
        let (sessions, rpc, log) = connected(|cmd| match cmd {
            Command::BatchTransactions { .. } => json!(true).into(),
            _ => reply(json!(null)),
        })
        .await;

        let transactions = vec![Transaction::new(A, "mint", interface())
            .chained_args(|_| Err(BridgeError::encoding("args", "nothing to chain")))];

        let outcome = BatchExecutor::new(&sessions, &rpc)
            .execute(transactions)
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Halted { index: 0 });
        assert!(!log.methods().contains(&"requestCall"));
    }

    #[tokio::test]
    async fn test_refused_batch_runs_nothing() {
        let (sessions, rpc, log) = connected(|cmd| match cmd {
            Command::BatchTransactions { .. } => json!(false).into(),
            _ => reply(json!(null)),
        })
        .await;

        let transactions = vec![Transaction::new(A, "mint", interface()).args(vec![json!(1)])];
        let outcome = BatchExecutor::new(&sessions, &rpc)
            .execute(transactions)
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::Rejected);
        assert_eq!(log.methods(), vec!["requestConnect", "batchTransactions"]);
    }

    #[tokio::test]
    async fn test_query_transaction_decodes_reply() {
        let (sessions, rpc, _log) = connected(|cmd| match cmd {
            Command::BatchTransactions { .. } => json!(true).into(),
            Command::RequestQuery { .. } => json!({
                "status": "replied",
                "reply": {"arg": encode_bytes(b"{\"e8s\":5}")}
            })
            .into(),
            _ => TransportError::InvalidData("unexpected".into()).into(),
        })
        .await;

        let balance = Arc::new(Mutex::new(None));
        let slot = balance.clone();
        let transactions = vec![Transaction::new(A, "balance", interface()).on_success(
            move |response| {
                *slot.lock().unwrap() = Some(response);
                async { None }
            },
        )];

        let outcome = BatchExecutor::new(&sessions, &rpc)
            .execute(transactions)
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(*balance.lock().unwrap(), Some(json!({"e8s": 5})));
    }

    #[tokio::test]
    async fn test_sign_infos_describe_fixed_args() {
        let (sessions, rpc, log) = connected(|_| json!(false).into()).await;

        let transactions = vec![
            Transaction::new(A, "mint", interface()).args(vec![json!(7)]),
            Transaction::new(A, "stake", interface()).chained_args(|_| Ok(vec![])),
        ];
        BatchExecutor::new(&sessions, &rpc)
            .execute(transactions)
            .await
            .unwrap();

        let commands = log.commands();
        let Some(Command::BatchTransactions { sign_infos, .. }) = commands.last() else {
            panic!("expected batchTransactions");
        };
        assert_eq!(sign_infos[0].decoded_arguments, Some(json!([7])));
        assert_eq!(sign_infos[0].arguments.as_deref(), Some("Wzdd"));
        assert_eq!(sign_infos[0].request_type.as_deref(), Some("unknown"));
        assert_eq!(sign_infos[1].arguments.as_deref(), Some(""));
        assert!(sign_infos[1].decoded_arguments.is_none());
    }

    struct UnencodableInterface;

    impl ArgDecoder for UnencodableInterface {
        fn decode_args(&self, _method_name: &str, _arg: &[u8]) -> Option<Value> {
            None
        }
    }

    impl CanisterInterface for UnencodableInterface {
        fn encode_args(&self, method_name: &str, _args: &[Value]) -> BridgeResult<Vec<u8>> {
            Err(BridgeError::encoding(method_name, "argument type mismatch"))
        }

        fn decode_reply(&self, _method_name: &str, _reply: &[u8]) -> BridgeResult<Value> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_unencodable_args_fail_before_approval() {
        let (sessions, rpc, log) = connected(|_| json!(true).into()).await;

        let transactions = vec![
            Transaction::new(A, "mint", interface()).args(vec![json!(1)]),
            Transaction::new(A, "transfer", Arc::new(UnencodableInterface)).args(vec![json!("x")]),
        ];
        let err = BatchExecutor::new(&sessions, &rpc)
            .execute(transactions)
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Encoding { .. }));
        assert!(!log.methods().contains(&"batchTransactions"));
    }

    #[tokio::test]
    async fn test_empty_values_are_not_chained() {
        let (sessions, rpc, _log) = connected(|cmd| match cmd {
            Command::BatchTransactions { .. } => json!(true).into(),
            Command::RequestCall { .. } => reply(json!({})),
            _ => TransportError::InvalidData("unexpected".into()).into(),
        })
        .await;

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        let transactions = vec![
            Transaction::new(A, "mint", interface())
                .args(vec![])
                .on_success(|_| async { Some(json!(0)) }),
            Transaction::new(A, "mint", interface())
                .args(vec![])
                .on_success(|_| async { Some(json!("")) }),
            Transaction::new(A, "mint", interface())
                .args(vec![])
                .on_success(|_| async { Some(json!({"minted": 2})) }),
            Transaction::new(A, "stake", interface()).chained_args(move |prev| {
                *slot.lock().unwrap() = Some(prev.to_vec());
                Ok(vec![])
            }),
        ];

        let outcome = BatchExecutor::new(&sessions, &rpc)
            .execute(transactions)
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(vec![TransactionPrevResponse {
                index: 2,
                response: json!({"minted": 2}),
            }])
        );
    }
}
