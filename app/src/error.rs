use crate::instance::ServiceError;
use crate::runner::SafetyViolation;

#[derive(Debug)]
pub enum Error {
    UnknownService(String),
    UnknownExperiment(String),
    ExperimentNotPending(String),
    NoHealthyInstances(String),
    ServiceAlreadyExists(String),
    InvalidFleetSpec(String),
    ChaosDisabled,
    NoChaosTargets,
    SafetyViolation(SafetyViolation),
    Request(ServiceError),
}

impl From<SafetyViolation> for Error {
    fn from(e: SafetyViolation) -> Self {
        Error::SafetyViolation(e)
    }
}

impl From<ServiceError> for Error {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::UnknownService(name) => Error::UnknownService(name),
            ServiceError::NoHealthyInstances(name) => Error::NoHealthyInstances(name),
            other => Error::Request(other),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnknownService(name) => write!(f, "unknown service {name}"),
            Error::UnknownExperiment(id) => write!(f, "unknown experiment {id}"),
            Error::ExperimentNotPending(id) => {
                write!(f, "experiment {id} has already been started")
            }
            Error::NoHealthyInstances(name) => {
                write!(f, "no healthy instances available for {name}")
            }
            Error::ServiceAlreadyExists(name) => write!(f, "service {name} already registered"),
            Error::InvalidFleetSpec(reason) => write!(f, "invalid fleet spec: {reason}"),
            Error::ChaosDisabled => write!(f, "chaos monkey is disabled"),
            Error::NoChaosTargets => write!(f, "no eligible chaos targets"),
            Error::SafetyViolation(e) => write!(f, "{e}"),
            Error::Request(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}
