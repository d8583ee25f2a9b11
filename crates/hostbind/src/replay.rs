use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use hostbind_contracts::REPLAY_REPORT_SCHEMA_VERSION;
use hostbind_core::{
    ArgFact, CallFacts, DestroyRecord, LifetimeError, LiveObject, Manager, ManagerConfig,
    NativeHandle, NativeSignal, ProxyRef, SimHeap, StateSnapshot, TransferPolicy,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::check::load_table;
use crate::session::{load_session, Action, ArgRef, Step};

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Descriptor table the session runs against.
    #[arg(long, value_name = "PATH")]
    pub descriptors: PathBuf,

    /// Session script to replay.
    #[arg(value_name = "SESSION")]
    pub session: PathBuf,

    /// Overrides HOSTBIND_TRANSFER_POLICY.
    #[arg(long, value_enum, value_name = "POLICY")]
    pub transfer_policy: Option<TransferPolicy>,

    /// Trust refcount arithmetic instead of reading native counts.
    #[arg(long)]
    pub no_peek: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<String>,
    pub message: String,
}

impl StepError {
    fn from_lifetime(err: &LifetimeError) -> Self {
        let violation = match err {
            LifetimeError::Invariant(v) => Some(v.kind().to_string()),
            _ => None,
        };
        Self {
            kind: err.kind().to_string(),
            violation,
            message: err.to_string(),
        }
    }

    fn matches(&self, expected: &str) -> bool {
        self.kind == expected || self.violation.as_deref() == Some(expected)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub op: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NativeReport {
    pub live: Vec<LiveObject>,
    pub destroyed: Vec<DestroyRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub schema_version: String,
    pub ok: bool,
    pub steps: Vec<StepOutcome>,
    pub state: StateSnapshot,
    pub native: NativeReport,
}

pub fn cmd_replay(args: ReplayArgs) -> Result<std::process::ExitCode> {
    let table = load_table(&args.descriptors)?;
    let script = load_session(&args.session)?;

    let mut config = ManagerConfig::from_env().context("read manager config from environment")?;
    if let Some(policy) = args.transfer_policy {
        config.transfer_policy = policy;
    }
    if args.no_peek {
        config.peek_refcounts = false;
    }

    let manager = Manager::new(table, SimHeap::new(), config);
    let report = replay(&manager, &script.steps)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.ok {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::from(1)
    })
}

/// Runs `steps` in order. The first step with an unexpected outcome stops the
/// replay, as a fatal lifetime error would stop the host.
pub fn replay(manager: &Manager<SimHeap>, steps: &[Step]) -> Result<ReplayReport> {
    let mut session = Session {
        manager,
        proxies: BTreeMap::new(),
        natives: BTreeMap::new(),
    };
    let mut outcomes = Vec::with_capacity(steps.len());
    let mut ok = true;
    for (index, step) in steps.iter().enumerate() {
        let res = session
            .run(&step.action)
            .with_context(|| format!("step {index} ({})", step.action.op()))?;
        let (result, error) = match res {
            Ok(v) => (Some(v), None),
            Err(err) => (None, Some(StepError::from_lifetime(&err))),
        };
        let step_ok = match (&error, step.expect_error.as_deref()) {
            (None, None) => true,
            (Some(err), Some(expected)) => err.matches(expected),
            _ => false,
        };
        debug!(index, op = step.action.op(), ok = step_ok, "step replayed");
        outcomes.push(StepOutcome {
            index,
            op: step.action.op(),
            ok: step_ok,
            result,
            error,
            expected_error: step.expect_error.clone(),
        });
        if !step_ok {
            ok = false;
            break;
        }
    }
    info!(steps = outcomes.len(), ok, "session replayed");

    Ok(ReplayReport {
        schema_version: REPLAY_REPORT_SCHEMA_VERSION.to_string(),
        ok,
        steps: outcomes,
        state: manager.snapshot(),
        native: NativeReport {
            live: manager.native().live_objects(),
            destroyed: manager.native().destroyed(),
        },
    })
}

struct Session<'a> {
    manager: &'a Manager<SimHeap>,
    proxies: BTreeMap<String, ProxyRef>,
    natives: BTreeMap<String, NativeHandle>,
}

impl Session<'_> {
    fn proxy(&self, name: &str) -> Result<ProxyRef> {
        self.proxies
            .get(name)
            .copied()
            .with_context(|| format!("no proxy bound to {name:?}"))
    }

    fn fact(&self, arg: &ArgRef) -> Result<ArgFact> {
        Ok(match arg {
            ArgRef::Null => ArgFact::Null,
            ArgRef::Plain => ArgFact::Plain,
            ArgRef::Proxy(name) => ArgFact::Proxy(self.proxy(name)?),
            ArgRef::Handle(h) => ArgFact::Handle(*h),
            ArgRef::Native(name) => ArgFact::Handle(
                self.natives
                    .get(name)
                    .copied()
                    .with_context(|| format!("no native object bound to {name:?}"))?,
            ),
        })
    }

    /// Outer errors are script errors; inner errors are the manager's verdict.
    fn run(&mut self, action: &Action) -> Result<Result<Value, LifetimeError>> {
        let m = self.manager;
        let verdict = match action {
            Action::Alloc {
                type_name,
                bind,
                at,
            } => {
                let h = match at {
                    Some(h) => m.native().alloc_at(type_name, *h),
                    None => m.native().alloc(type_name),
                };
                self.natives.insert(bind.clone(), h);
                Ok(serde_json::to_value(h)?)
            }
            Action::Call {
                owner,
                signature,
                receiver,
                args,
                ret,
                bind,
            } => {
                let mut facts = CallFacts::new();
                if let Some(name) = receiver {
                    facts = facts.receiver(self.proxy(name)?);
                }
                for arg in args {
                    facts = facts.arg(self.fact(arg)?);
                }
                if let Some(ret) = ret {
                    facts = facts.returns(self.fact(ret)?);
                }
                let res = m
                    .call(owner, signature)
                    .cloned()
                    .and_then(|desc| m.resolve_call(&desc, &facts));
                match res {
                    Ok(resolution) => {
                        if let Some(name) = bind {
                            let r = resolution.ret().with_context(|| {
                                format!("{owner}::{signature} produced no return proxy to bind as {name:?}")
                            })?;
                            self.proxies.insert(name.clone(), r);
                        }
                        Ok(serde_json::to_value(&resolution)?)
                    }
                    Err(err) => Err(err),
                }
            }
            Action::Raise {
                owner,
                signature,
                error,
                message,
            } => {
                let signal = NativeSignal::new(error.as_str(), message.as_str());
                match m.call(owner, signature).cloned() {
                    Ok(desc) => match m.bridge_error(&desc, &signal) {
                        Ok(host) => Ok(serde_json::to_value(&host)?),
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                }
            }
            Action::Incref { proxy } => m
                .incref(self.proxy(proxy)?)
                .map(|count| serde_json::json!({ "count": count })),
            Action::Decref { proxy } => match m.decref(self.proxy(proxy)?) {
                Ok(outcome) => Ok(serde_json::to_value(&outcome)?),
                Err(err) => Err(err),
            },
            Action::Peek { proxy } => m
                .peek(self.proxy(proxy)?)
                .map(|count| serde_json::json!({ "count": count })),
            Action::Finalize { proxy } => match m.finalize_proxy(self.proxy(proxy)?) {
                Ok(fin) => Ok(serde_json::to_value(&fin)?),
                Err(err) => Err(err),
            },
            Action::Shutdown => {
                let dropped = m.shutdown();
                self.proxies.clear();
                Ok(serde_json::json!({ "dropped": dropped }))
            }
        };
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionScript;
    use hostbind_core::{CallDescriptor, DescriptorTable, TypeDescriptor, ValueDescriptor};

    fn manager() -> Manager<SimHeap> {
        let table = DescriptorTable::from_parts(
            vec![TypeDescriptor::owned("Foo")],
            vec![],
            vec![
                CallDescriptor::function("mod", "makeFoo()")
                    .returns(ValueDescriptor::of("Foo").caller_owns()),
                CallDescriptor::function("mod", "consumeFoo(Foo*)")
                    .param(ValueDescriptor::of("Foo").transfer()),
            ],
        )
        .unwrap();
        Manager::new(table, SimHeap::new(), ManagerConfig::default())
    }

    fn steps(json: &str) -> Vec<Step> {
        let script: SessionScript = serde_json::from_str(json).unwrap();
        script.steps
    }

    #[test]
    fn expected_errors_keep_the_session_ok() {
        let m = manager();
        let report = replay(
            &m,
            &steps(
                r#"{"schema_version": "hostbind.session@0.1.0", "steps": [
                  {"op": "alloc", "type": "Foo", "bind": "h"},
                  {"op": "call", "owner": "mod", "signature": "makeFoo()", "return": {"native": "h"}, "bind": "foo"},
                  {"op": "call", "owner": "mod", "signature": "consumeFoo(Foo*)", "args": [{"proxy": "foo"}]},
                  {"op": "call", "owner": "mod", "signature": "consumeFoo(Foo*)", "args": [{"proxy": "foo"}],
                   "expect_error": "double_transfer"}
                ]}"#,
            ),
        )
        .unwrap();
        assert!(report.ok);
        assert_eq!(report.steps.len(), 4);
        let err = report.steps[3].error.as_ref().unwrap();
        assert_eq!(err.kind, "invariant_violation");
        assert_eq!(err.violation.as_deref(), Some("double_transfer"));
        assert!(report.state.proxies.is_empty());
        assert_eq!(report.native.live.len(), 1);
    }

    #[test]
    fn unexpected_error_stops_the_replay() {
        let m = manager();
        let report = replay(
            &m,
            &steps(
                r#"{"schema_version": "hostbind.session@0.1.0", "steps": [
                  {"op": "alloc", "type": "Foo", "bind": "h"},
                  {"op": "call", "owner": "mod", "signature": "makeFoo()", "return": {"native": "h"}, "bind": "foo"},
                  {"op": "finalize", "proxy": "foo"},
                  {"op": "finalize", "proxy": "foo"},
                  {"op": "shutdown"}
                ]}"#,
            ),
        )
        .unwrap();
        assert!(!report.ok);
        assert_eq!(report.steps.len(), 4);
        assert_eq!(
            report.steps[3].error.as_ref().unwrap().violation.as_deref(),
            Some("stale_proxy")
        );
        assert_eq!(report.native.destroyed.len(), 1);
    }

    #[test]
    fn unbound_names_are_script_errors() {
        let m = manager();
        let err = replay(
            &m,
            &steps(
                r#"{"schema_version": "hostbind.session@0.1.0", "steps": [
                  {"op": "finalize", "proxy": "ghost"}
                ]}"#,
            ),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("no proxy bound to \"ghost\""));
    }
}
