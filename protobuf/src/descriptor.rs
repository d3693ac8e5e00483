//! A static descriptor table for the services compiled into this crate.
//!
//! RBAC validation resolves role service and method names against this table,
//! and the per-method scope opt-in recorded here mirrors the `(rbac.v1.scope)`
//! method options in the proto sources. The table is populated from a static
//! list rather than discovered at runtime; new services must be added here
//! when their proto is added to the build.

#[derive(Debug, Clone, Copy)]
pub struct ServiceDescriptor {
    pub full_name: &'static str,
    pub methods: &'static [MethodDescriptor],
}

#[derive(Debug, Clone, Copy)]
pub struct MethodDescriptor {
    pub name: &'static str,
    /// Whether the method declares the `(rbac.v1.scope)` option, making a
    /// scope value mandatory in any role that grants it.
    pub scope_enabled: bool,
    pub server_streaming: bool,
}

impl ServiceDescriptor {
    pub fn method(&self, name: &str) -> Option<&'static MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }
}

pub const JOB_SERVICE: ServiceDescriptor = ServiceDescriptor {
    full_name: "job.v1.Job",
    methods: &[
        MethodDescriptor {
            name: "Start",
            scope_enabled: false,
            server_streaming: false,
        },
        MethodDescriptor {
            name: "Stop",
            scope_enabled: false,
            server_streaming: false,
        },
        MethodDescriptor {
            name: "Status",
            scope_enabled: true,
            server_streaming: false,
        },
        MethodDescriptor {
            name: "List",
            scope_enabled: true,
            server_streaming: false,
        },
        MethodDescriptor {
            name: "Output",
            scope_enabled: false,
            server_streaming: true,
        },
    ],
};

const SERVICES: &[ServiceDescriptor] = &[JOB_SERVICE];

pub fn find_service(full_name: &str) -> Option<&'static ServiceDescriptor> {
    SERVICES.iter().find(|s| s.full_name == full_name)
}

/// Splits `/pkg.Service/Method` into `(pkg.Service, Method)`.
pub fn split_fully_qualified_method(fqn: &str) -> Option<(&str, &str)> {
    let rest = fqn.strip_prefix('/')?;
    let (service, method) = rest.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_job_service() {
        let svc = find_service("job.v1.Job").expect("job service registered");
        assert!(svc.method("Start").is_some());
        assert!(svc.method("Status").unwrap().scope_enabled);
        assert!(svc.method("Output").unwrap().server_streaming);
        assert!(svc.method("Restart").is_none());
        assert!(find_service("job.v1.Nope").is_none());
    }

    #[test]
    fn split_method_names() {
        assert_eq!(
            split_fully_qualified_method("/job.v1.Job/Start"),
            Some(("job.v1.Job", "Start"))
        );
        assert_eq!(split_fully_qualified_method("job.v1.Job/Start"), None);
        assert_eq!(split_fully_qualified_method("/job.v1.Job"), None);
        assert_eq!(split_fully_qualified_method("//Start"), None);
        assert_eq!(split_fully_qualified_method("/job.v1.Job/"), None);
        assert_eq!(split_fully_qualified_method("/a/b/c"), None);
    }
}
