//! RBAC config validation, performed once at load time. A config that
//! validates successfully can be evaluated without further error checking.

use std::collections::HashSet;

use thiserror::Error;

use crate::descriptor::find_service;
use crate::rbac::v1::{Config, Scope};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("role id cannot be empty")]
    EmptyRoleId,
    #[error("duplicate role id {0:?}")]
    DuplicateRoleId(String),
    #[error("invalid role {role:?}: service {service:?} not found")]
    ServiceNotFound { role: String, service: String },
    #[error("invalid role {role:?}: method name cannot be empty")]
    EmptyMethodName { role: String },
    #[error("invalid role {role:?}: duplicate method name {method:?}")]
    DuplicateMethodName { role: String, method: String },
    #[error("invalid role {role:?}: service {service:?} does not contain method {method:?}")]
    MethodNotFound {
        role: String,
        service: String,
        method: String,
    },
    #[error("invalid role {role:?}: method {method:?} has invalid scope value {value}")]
    InvalidScopeValue {
        role: String,
        method: String,
        value: i32,
    },
    #[error("invalid role {role:?}: method {method:?} does not support scopes")]
    ScopeNotSupported { role: String, method: String },
    #[error("invalid role {role:?}: method {method:?} requires a scope")]
    ScopeRequired { role: String, method: String },
    #[error("role binding id cannot be empty")]
    EmptyRoleBindingId,
    #[error("duplicate role binding id {0:?}")]
    DuplicateRoleBindingId(String),
    #[error("invalid role binding {binding:?}: role id cannot be empty")]
    EmptyBindingRoleId { binding: String },
    #[error("invalid role binding {binding:?}: role {role:?} not found")]
    BindingRoleNotFound { binding: String, role: String },
    #[error("invalid role binding {binding:?}: at least one user must be configured")]
    NoUsers { binding: String },
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_roles()?;
        self.validate_role_bindings()?;
        Ok(())
    }

    fn validate_roles(&self) -> Result<(), ValidationError> {
        let mut role_ids = HashSet::new();
        for role in &self.roles {
            if role.id.is_empty() {
                return Err(ValidationError::EmptyRoleId);
            }
            if !role_ids.insert(role.id.as_str()) {
                return Err(ValidationError::DuplicateRoleId(role.id.clone()));
            }

            let service = find_service(&role.service).ok_or_else(|| {
                ValidationError::ServiceNotFound {
                    role: role.id.clone(),
                    service: role.service.clone(),
                }
            })?;

            let mut method_names = HashSet::new();
            for m in &role.allowed_methods {
                if m.name.is_empty() {
                    return Err(ValidationError::EmptyMethodName {
                        role: role.id.clone(),
                    });
                }
                if !method_names.insert(m.name.as_str()) {
                    return Err(ValidationError::DuplicateMethodName {
                        role: role.id.clone(),
                        method: m.name.clone(),
                    });
                }
                let descriptor = service.method(&m.name).ok_or_else(|| {
                    ValidationError::MethodNotFound {
                        role: role.id.clone(),
                        service: role.service.clone(),
                        method: m.name.clone(),
                    }
                })?;

                if let Some(value) = m.scope {
                    if Scope::try_from(value).is_err() {
                        return Err(ValidationError::InvalidScopeValue {
                            role: role.id.clone(),
                            method: m.name.clone(),
                            value,
                        });
                    }
                }
                // a scope must be configured iff the method opts in to
                // scope semantics
                match (m.scope.is_some(), descriptor.scope_enabled) {
                    (true, false) => {
                        return Err(ValidationError::ScopeNotSupported {
                            role: role.id.clone(),
                            method: m.name.clone(),
                        });
                    }
                    (false, true) => {
                        return Err(ValidationError::ScopeRequired {
                            role: role.id.clone(),
                            method: m.name.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn validate_role_bindings(&self) -> Result<(), ValidationError> {
        let mut binding_ids = HashSet::new();
        for rb in &self.role_bindings {
            if rb.id.is_empty() {
                return Err(ValidationError::EmptyRoleBindingId);
            }
            if !binding_ids.insert(rb.id.as_str()) {
                return Err(ValidationError::DuplicateRoleBindingId(rb.id.clone()));
            }
            if rb.role_id.is_empty() {
                return Err(ValidationError::EmptyBindingRoleId {
                    binding: rb.id.clone(),
                });
            }
            if !self.roles.iter().any(|r| r.id == rb.role_id) {
                return Err(ValidationError::BindingRoleNotFound {
                    binding: rb.id.clone(),
                    role: rb.role_id.clone(),
                });
            }
            if rb.users.is_empty() {
                return Err(ValidationError::NoUsers {
                    binding: rb.id.clone(),
                });
            }
        }
        Ok(())
    }
}
