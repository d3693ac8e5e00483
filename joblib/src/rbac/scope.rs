//! Scope checks for handlers that touch user-owned resources.

use tonic::Status;

use protobuf::rbac::v1::Scope;

use crate::auth::CallContext;

fn scope_not_supported() -> Status {
    Status::invalid_argument("scope not supported")
}

/// Verifies that the caller may access a resource assigned to
/// `assigned_user`, based on the scope of the resolved method permission.
pub fn verify_scope_for_user(cx: &CallContext, assigned_user: &str) -> Result<(), Status> {
    let user = cx.authenticated_user();
    match cx.allowed_method().scope() {
        Scope::AllUsers => Ok(()),
        Scope::CurrentUser if user == assigned_user => Ok(()),
        Scope::CurrentUser => Err(Status::permission_denied("permission denied")),
        Scope::Unset => Err(scope_not_supported()),
    }
}

/// An item that is assigned to a user, for scope filtering.
pub trait UserAssignable {
    fn assigned_user(&self) -> &str;
}

/// Filters `items` by the scope of the resolved method permission: under
/// `CURRENT_USER` only the caller's own items are retained; under
/// `ALL_USERS` the items pass through unchanged.
pub fn filter_by_scope<T: UserAssignable>(
    cx: &CallContext,
    items: Vec<T>,
) -> Result<Vec<T>, Status> {
    let user = cx.authenticated_user();
    match cx.allowed_method().scope() {
        Scope::AllUsers => Ok(items),
        Scope::CurrentUser => Ok(items
            .into_iter()
            .filter(|item| item.assigned_user() == user)
            .collect()),
        Scope::Unset => Err(scope_not_supported()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PeerInfo;
    use protobuf::rbac::v1::AllowedMethod;
    use tonic::Code;

    #[derive(Debug)]
    struct Owned(&'static str, &'static str);

    impl UserAssignable for Owned {
        fn assigned_user(&self) -> &str {
            self.1
        }
    }

    fn scoped_call(user: &str, scope: Option<Scope>) -> CallContext {
        let mut cx = CallContext::new("/job.v1.Job/List".into(), PeerInfo::Unknown);
        cx.set_authenticated_user(user.into());
        cx.set_allowed_method(AllowedMethod {
            name: "List".into(),
            scope: scope.map(|s| s as i32),
        });
        cx
    }

    #[test]
    fn verify_all_users_always_allows() {
        let cx = scoped_call("alice", Some(Scope::AllUsers));
        verify_scope_for_user(&cx, "alice").unwrap();
        verify_scope_for_user(&cx, "bob").unwrap();
        verify_scope_for_user(&cx, "").unwrap();
    }

    #[test]
    fn verify_current_user_requires_ownership() {
        let cx = scoped_call("alice", Some(Scope::CurrentUser));
        verify_scope_for_user(&cx, "alice").unwrap();
        let err = verify_scope_for_user(&cx, "bob").unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[test]
    fn verify_unset_scope_is_invalid_argument() {
        let cx = scoped_call("alice", None);
        let err = verify_scope_for_user(&cx, "alice").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "scope not supported");

        let cx = scoped_call("alice", Some(Scope::Unset));
        let err = verify_scope_for_user(&cx, "alice").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn filter_all_users_passes_everything_through() {
        let cx = scoped_call("alice", Some(Scope::AllUsers));
        let items = vec![Owned("a", "alice"), Owned("b", "bob")];
        let filtered = filter_by_scope(&cx, items).unwrap();
        assert_eq!(
            filtered.iter().map(|o| o.0).collect::<Vec<_>>(),
            ["a", "b"]
        );
    }

    #[test]
    fn filter_current_user_keeps_only_owned_items() {
        let cx = scoped_call("alice", Some(Scope::CurrentUser));
        let items = vec![
            Owned("a", "alice"),
            Owned("b", "bob"),
            Owned("c", "alice"),
        ];
        let filtered = filter_by_scope(&cx, items).unwrap();
        assert_eq!(
            filtered.iter().map(|o| o.0).collect::<Vec<_>>(),
            ["a", "c"]
        );
    }

    #[test]
    fn filter_unset_scope_is_invalid_argument() {
        let cx = scoped_call("alice", None);
        let err = filter_by_scope(&cx, vec![Owned("a", "alice")]).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
