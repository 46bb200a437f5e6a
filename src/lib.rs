#[macro_use]
extern crate error_chain;

pub mod clusteroperator;
pub mod config;
pub mod controller;
pub mod converge;
pub mod crd;
pub mod manager;
pub mod operand;
pub mod resourcemerge;
pub mod resources;
pub mod semantic;
pub mod status;
pub mod store;
pub mod util;

#[cfg(test)]
mod fake;

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            Json(serde_json::Error);
            Yaml(serde_yaml::Error);
            Kube(kube::Error);
        }

        errors {
            MissingName(kind: String) {
                description("object has no name")
                display("{} object has no name", kind)
            }
        }
    }

    fn api_error(err: &Error) -> Option<&kube::core::ErrorResponse> {
        match err.kind() {
            ErrorKind::Kube(kube::Error::Api(resp)) => Some(resp),
            _ => None,
        }
    }

    /// Reports whether the error is a 404 from the API server.
    pub fn is_not_found(err: &Error) -> bool {
        api_error(err).map_or(false, |resp| resp.code == 404)
    }

    /// Reports whether a create failed because the object already exists.
    pub fn is_already_exists(err: &Error) -> bool {
        api_error(err).map_or(false, |resp| resp.code == 409 && resp.reason == "AlreadyExists")
    }

    /// Reports whether a write lost an optimistic concurrency race.
    pub fn is_conflict(err: &Error) -> bool {
        api_error(err).map_or(false, |resp| resp.code == 409 && resp.reason == "Conflict")
    }
}
