use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepwise_core::error::Result;
use stepwise_core::property::Property;
use stepwise_core::types::ValueMap;

use crate::flow::{Step, StepInvocation, StepOutcome};
use crate::variables::WriteOperation;

/// Exposes a variable's current value as an output of the same name.
#[derive(Debug, Clone)]
pub struct VariableReadStep {
    variable: Property,
}

impl VariableReadStep {
    pub fn new(variable: Property) -> Self {
        Self { variable }
    }
}

impl Step for VariableReadStep {
    fn kind(&self) -> &'static str {
        "variable_read"
    }

    fn inputs(&self) -> Vec<Property> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Property> {
        // Unset variables without a default produce no value.
        vec![self.variable.clone().optional()]
    }

    fn declared_variables(&self) -> Vec<Property> {
        vec![self.variable.clone()]
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let value = call.scope.variables.read(&self.variable.name)?;
            let mut outputs = ValueMap::new();
            if !value.is_null() {
                outputs.insert(self.variable.name.clone(), value);
            }
            Ok(StepOutcome::next(outputs))
        })
    }

    fn to_config(&self) -> Value {
        json!({ "step_type": "variable_read", "variable": self.variable })
    }
}

/// Writes its single input, named after the variable, with the given
/// operation.
#[derive(Debug, Clone)]
pub struct VariableWriteStep {
    variable: Property,
    operation: WriteOperation,
}

impl VariableWriteStep {
    pub fn new(variable: Property, operation: WriteOperation) -> Result<Self> {
        operation.check(&variable)?;
        Ok(Self {
            variable,
            operation,
        })
    }

    pub fn overwrite(variable: Property) -> Self {
        Self {
            variable,
            operation: WriteOperation::Overwrite,
        }
    }
}

impl Step for VariableWriteStep {
    fn kind(&self) -> &'static str {
        "variable_write"
    }

    fn inputs(&self) -> Vec<Property> {
        vec![self.operation.value_descriptor(&self.variable)]
    }

    fn outputs(&self) -> Vec<Property> {
        Vec::new()
    }

    fn variable_writes(&self) -> Vec<(String, WriteOperation)> {
        vec![(self.variable.name.clone(), self.operation)]
    }

    fn declared_variables(&self) -> Vec<Property> {
        vec![self.variable.clone()]
    }

    fn invoke<'a>(&'a self, call: StepInvocation<'a>) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let StepInvocation { mut inputs, scope, .. } = call;
            let name = &self.variable.name;
            let value = inputs.remove(name).unwrap_or(Value::Null);
            scope.variables.write(name, self.operation, value)?;
            Ok(StepOutcome::next(ValueMap::new()))
        })
    }

    fn to_config(&self) -> Value {
        json!({
            "step_type": "variable_write",
            "variable": self.variable,
            "operation": self.operation,
        })
    }
}
