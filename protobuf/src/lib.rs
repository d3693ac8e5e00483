//! Generated wire types for the job and RBAC APIs, plus the static service
//! descriptor table and RBAC config validation.

pub mod job {
    pub mod v1 {
        tonic::include_proto!("job.v1");
    }
}

pub mod rbac {
    pub mod v1 {
        tonic::include_proto!("rbac.v1");
    }
}

mod descriptor;
mod validation;

pub use descriptor::{
    find_service, split_fully_qualified_method, MethodDescriptor, ServiceDescriptor, JOB_SERVICE,
};
pub use validation::ValidationError;

/// Deserializes an optional [`rbac::v1::Scope`] field from either its enum
/// name (the protobuf JSON form, e.g. `CURRENT_USER`) or its number.
pub fn scope_from_name<'de, D>(de: D) -> Result<Option<i32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Name(String),
        Number(i32),
    }

    match Option::<Repr>::deserialize(de)? {
        None => Ok(None),
        Some(Repr::Number(n)) => Ok(Some(n)),
        Some(Repr::Name(name)) => rbac::v1::Scope::from_str_name(&name)
            .map(|scope| Some(scope as i32))
            .ok_or_else(|| serde::de::Error::custom(format!("unknown scope {name:?}"))),
    }
}

/// Serializes an optional [`rbac::v1::Scope`] field as its enum name where
/// possible, falling back to the raw number for out-of-range values.
pub fn scope_to_name<S>(scope: &Option<i32>, ser: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match scope {
        None => ser.serialize_none(),
        Some(n) => match rbac::v1::Scope::try_from(*n) {
            Ok(scope) => ser.serialize_str(scope.as_str_name()),
            Err(_) => ser.serialize_i32(*n),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::rbac::v1::{Config, Scope};

    #[test]
    fn config_parses_from_yaml() {
        let config: Config = serde_yaml::from_str(
            r#"
roles:
  - id: admin
    service: job.v1.Job
    allowedMethods:
      - name: Start
      - name: List
        scope: ALL_USERS
roleBindings:
  - id: admin-binding
    roleId: admin
    users: [alice, bob]
"#,
        )
        .expect("yaml parse");

        assert_eq!(config.roles.len(), 1);
        assert_eq!(config.roles[0].service, "job.v1.Job");
        assert_eq!(config.roles[0].allowed_methods[0].scope, None);
        assert_eq!(
            config.roles[0].allowed_methods[1].scope,
            Some(Scope::AllUsers as i32)
        );
        assert_eq!(config.role_bindings[0].role_id, "admin");
        assert_eq!(config.role_bindings[0].users, vec!["alice", "bob"]);
    }

    #[test]
    fn config_parses_from_json() {
        let config: Config = serde_json::from_str(
            r#"{
              "roles": [
                {
                  "id": "viewer",
                  "service": "job.v1.Job",
                  "allowedMethods": [{"name": "Status", "scope": "CURRENT_USER"}]
                }
              ],
              "roleBindings": [{"id": "b", "roleId": "viewer", "users": ["carol"]}]
            }"#,
        )
        .expect("json parse");

        assert_eq!(
            config.roles[0].allowed_methods[0].scope,
            Some(Scope::CurrentUser as i32)
        );
    }

    #[test]
    fn unknown_scope_name_is_rejected() {
        let err = serde_yaml::from_str::<Config>(
            r#"
roles:
  - id: admin
    service: job.v1.Job
    allowedMethods:
      - name: List
        scope: EVERYONE
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("EVERYONE"), "{err}");
    }
}
