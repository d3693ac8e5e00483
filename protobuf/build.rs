const SERDE_MESSAGE: &str =
    "#[derive(serde::Serialize, serde::Deserialize)] #[serde(rename_all = \"camelCase\", default)]";

fn main() {
    println!("cargo:rerun-if-changed=proto");
    tonic_build::configure()
        .bytes([".job.v1.ProcessOutput.output"])
        .type_attribute(".rbac.v1.Config", SERDE_MESSAGE)
        .type_attribute(".rbac.v1.Role", SERDE_MESSAGE)
        .type_attribute(".rbac.v1.AllowedMethod", SERDE_MESSAGE)
        .type_attribute(".rbac.v1.RoleBinding", SERDE_MESSAGE)
        .field_attribute(
            ".rbac.v1.AllowedMethod.scope",
            "#[serde(default, deserialize_with = \"crate::scope_from_name\", \
             serialize_with = \"crate::scope_to_name\")]",
        )
        .compile_protos(
            &["proto/job/v1/job.proto", "proto/rbac/v1/rbac.proto"],
            &["proto"],
        )
        .unwrap_or_else(|err| panic!("failed to compile protos: {err:?}"));
}
