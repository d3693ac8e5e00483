//! Per-call policy evaluation and scope enforcement.

mod scope;

use std::collections::HashSet;
use std::sync::Arc;

use tonic::Status;

use protobuf::rbac::v1::Config;
use protobuf::split_fully_qualified_method;

use crate::auth::{CallContext, Middleware};

pub use scope::{filter_by_scope, verify_scope_for_user, UserAssignable};

/// Middleware that resolves the caller's permission for the requested method
/// from the RBAC config, attaching the matched [`AllowedMethod`]
/// (protobuf `rbac.v1.AllowedMethod`) to the call context.
///
/// The config must have been validated; evaluation assumes well-formed roles
/// and bindings.
pub struct PolicyMiddleware {
    config: Arc<Config>,
}

impl PolicyMiddleware {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Middleware for PolicyMiddleware {
    fn evaluate(&self, mut cx: CallContext) -> Result<CallContext, Status> {
        let user = cx.authenticated_user().to_owned();
        let full_method = cx.full_method().to_owned();
        let (service, method) = split_fully_qualified_method(&full_method)
            .unwrap_or_else(|| panic!("bug: method name {full_method:?} is not fully qualified"));

        // roles bound to the caller
        let role_ids: HashSet<&str> = self
            .config
            .role_bindings
            .iter()
            .filter(|rb| rb.users.iter().any(|u| u == &user))
            .map(|rb| rb.role_id.as_str())
            .collect();

        // first matching role in config order wins
        for role in &self.config.roles {
            if !role_ids.contains(role.id.as_str()) {
                continue;
            }
            if role.service != service {
                continue;
            }
            if let Some(allowed) = role.allowed_methods.iter().find(|m| m.name == method) {
                cx.set_allowed_method(allowed.clone());
                return Ok(cx);
            }
        }

        Err(Status::permission_denied(format!(
            "user {user:?} is not authorized for method {full_method:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PeerInfo;
    use protobuf::rbac::v1::{AllowedMethod, Role, RoleBinding, Scope};
    use tonic::Code;

    fn config() -> Config {
        Config {
            roles: vec![
                Role {
                    id: "operator".into(),
                    service: "job.v1.Job".into(),
                    allowed_methods: vec![
                        AllowedMethod {
                            name: "Start".into(),
                            scope: None,
                        },
                        AllowedMethod {
                            name: "List".into(),
                            scope: Some(Scope::CurrentUser as i32),
                        },
                    ],
                },
                Role {
                    id: "auditor".into(),
                    service: "job.v1.Job".into(),
                    allowed_methods: vec![AllowedMethod {
                        name: "List".into(),
                        scope: Some(Scope::AllUsers as i32),
                    }],
                },
            ],
            role_bindings: vec![
                RoleBinding {
                    id: "operators".into(),
                    role_id: "operator".into(),
                    users: vec!["alice".into(), "bob".into()],
                },
                RoleBinding {
                    id: "auditors".into(),
                    role_id: "auditor".into(),
                    users: vec!["carol".into()],
                },
            ],
        }
    }

    fn call(user: &str, full_method: &str) -> CallContext {
        let mut cx = CallContext::new(full_method.into(), PeerInfo::Unknown);
        cx.set_authenticated_user(user.into());
        cx
    }

    #[test]
    fn authorizes_bound_user_for_allowed_method() {
        let middleware = PolicyMiddleware::new(config());
        let cx = middleware
            .evaluate(call("alice", "/job.v1.Job/Start"))
            .expect("alice may start jobs");
        assert_eq!(cx.allowed_method().name, "Start");
        assert_eq!(cx.allowed_method().scope, None);
    }

    #[test]
    fn attaches_scope_from_first_matching_role() {
        let middleware = PolicyMiddleware::new(config());
        let cx = middleware
            .evaluate(call("bob", "/job.v1.Job/List"))
            .expect("bob may list jobs");
        assert_eq!(cx.allowed_method().scope, Some(Scope::CurrentUser as i32));

        let cx = middleware
            .evaluate(call("carol", "/job.v1.Job/List"))
            .expect("carol may list jobs");
        assert_eq!(cx.allowed_method().scope, Some(Scope::AllUsers as i32));
    }

    #[test]
    fn denies_with_exact_message() {
        let middleware = PolicyMiddleware::new(config());
        let err = middleware
            .evaluate(call("carol", "/job.v1.Job/Start"))
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(
            err.message(),
            "user \"carol\" is not authorized for method \"/job.v1.Job/Start\""
        );
    }

    #[test]
    fn denies_unknown_user_and_unknown_service() {
        let middleware = PolicyMiddleware::new(config());
        assert_eq!(
            middleware
                .evaluate(call("mallory", "/job.v1.Job/Start"))
                .unwrap_err()
                .code(),
            Code::PermissionDenied
        );
        assert_eq!(
            middleware
                .evaluate(call("alice", "/other.v1.Other/Start"))
                .unwrap_err()
                .code(),
            Code::PermissionDenied
        );
    }

    #[test]
    #[should_panic(expected = "not fully qualified")]
    fn malformed_method_name_is_a_bug() {
        let middleware = PolicyMiddleware::new(config());
        let _ = middleware.evaluate(call("alice", "Start"));
    }
}
