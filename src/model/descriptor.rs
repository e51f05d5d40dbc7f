use crate::{errors::ConversionError, payload::Payload};
use std::fmt;
use uuid::Uuid;

/// Describes a workflow that can be started as a child: its registered name, a human readable
/// description, and how to derive a workflow id from encoded parameters.
///
/// `generate_workflow_id` must be deterministic: the same parameters always produce the same id,
/// since it runs inside workflow code.
pub trait WorkflowDescriptor: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn generate_workflow_id(&self, params: &Payload) -> Result<String, ConversionError>;
}

/// Namespace for ids generated by [NamedWorkflow]
const WORKFLOW_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c6f_6f6d_2d77_6f72_6b66_6c6f_772d_6964);

/// A descriptor that derives workflow ids as `{name}-{uuid}` where the uuid is a v5 hash of the
/// name and the parameter bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedWorkflow {
    name: String,
    description: String,
}

impl NamedWorkflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl WorkflowDescriptor for NamedWorkflow {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn generate_workflow_id(&self, params: &Payload) -> Result<String, ConversionError> {
        let mut key = Vec::with_capacity(self.name.len() + 1 + params.data.len());
        key.extend_from_slice(self.name.as_bytes());
        key.push(0);
        key.extend_from_slice(&params.data);
        Ok(format!(
            "{}-{}",
            self.name,
            Uuid::new_v5(&WORKFLOW_ID_NAMESPACE, &key)
        ))
    }
}

impl fmt::Display for NamedWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({})", self.name, self.description)
        }
    }
}

/// Check a descriptor before a child is scheduled with it, returning the generated id
pub(crate) fn resolve_workflow_id<D>(descriptor: &D, params: &Payload) -> Result<String, ConversionError>
where
    D: WorkflowDescriptor + ?Sized,
{
    if descriptor.name().is_empty() {
        return Err(ConversionError::EmptyWorkflowName);
    }
    let id = descriptor.generate_workflow_id(params)?;
    if id.is_empty() {
        return Err(ConversionError::EmptyWorkflowId(descriptor.name().to_string()));
    }
    Ok(id)
}
