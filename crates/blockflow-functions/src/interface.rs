//! Typed function interfaces, extracted from declared signatures.
//!
//! A [`Signature`] lists a function's parameters with their annotation text
//! (e.g. `Stream[shop.Order]`, `Optional[Reference]`, `int`) and an optional
//! return annotation. [`extract_interface`] classifies each parameter as the
//! execution context, a typed input or a typed parameter by matching those
//! annotations structurally.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::schema::ANY_SCHEMA_KEY;
use blockflow_core::types::DEFAULT_OUTPUT_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// One unprocessed block per run.
    Block,
    /// Every unprocessed block, iterated lazily.
    Stream,
    /// Latest upstream block; never consumed.
    Reference,
    /// Latest block this node emitted itself.
    SelfReference,
}

impl InputKind {
    /// Reference kinds never advance the consumption log.
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference | Self::SelfReference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Text,
    Integer,
    Float,
    Boolean,
    Json,
}

impl ParameterType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Json => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDef {
    pub name: String,
    pub kind: InputKind,
    pub schema_key: String,
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub name: String,
    pub schema_key: String,
    /// Function returns a lazy sequence of record batches.
    pub is_iterator: bool,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub param_type: ParameterType,
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionInterface {
    pub inputs: Vec<InputDef>,
    pub outputs: Vec<OutputDef>,
    pub parameters: Vec<ParameterDef>,
    pub uses_context: bool,
}

impl FunctionInterface {
    pub fn input(&self, name: &str) -> Option<&InputDef> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// The single input a `stdin` edge binds to, if unambiguous.
    pub fn default_input(&self) -> Option<&InputDef> {
        let mut candidates = self
            .inputs
            .iter()
            .filter(|i| i.kind != InputKind::SelfReference);
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }

    pub fn default_output(&self) -> Option<&OutputDef> {
        self.outputs.iter().find(|o| o.is_default)
    }

    pub fn output(&self, name: &str) -> Option<&OutputDef> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// One declared parameter of a function.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub annotation: Option<String>,
    pub default: Option<Value>,
}

/// Declared parameter list and return annotation of a function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    pub params: Vec<ParamSpec>,
    pub returns: Option<String>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: &str, annotation: &str) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            annotation: Some(annotation.to_string()),
            default: None,
        });
        self
    }

    pub fn param_default(mut self, name: &str, annotation: &str, default: Value) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            annotation: Some(annotation.to_string()),
            default: Some(default),
        });
        self
    }

    pub fn unannotated(mut self, name: &str) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            annotation: None,
            default: None,
        });
        self
    }

    pub fn returns(mut self, annotation: &str) -> Self {
        self.returns = Some(annotation.to_string());
        self
    }
}

const CONTEXT_PARAM_NAMES: &[&str] = &["ctx", "context"];

fn optional_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Optional\[(.+)\]$").expect("valid regex literal"))
}

fn generic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(?:\[([A-Za-z_][A-Za-z0-9_.]*)\])?$")
            .expect("valid regex literal")
    })
}

fn iterator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:Iterator|Iterable|Generator)\[(.+)\]$").expect("valid regex literal")
    })
}

/// A parsed annotation: optional flag, origin name and type argument.
struct Annotation {
    optional: bool,
    origin: String,
    arg: Option<String>,
}

fn parse_annotation(text: &str) -> Option<Annotation> {
    let text = text.trim();
    let (optional, inner) = match optional_re().captures(text) {
        Some(caps) => (true, caps.get(1)?.as_str().trim()),
        None => (false, text),
    };
    let caps = generic_re().captures(inner)?;
    Some(Annotation {
        optional,
        origin: caps.get(1)?.as_str().to_string(),
        arg: caps.get(2).map(|m| m.as_str().to_string()),
    })
}

fn input_kind(origin: &str) -> Option<InputKind> {
    match origin {
        "Block" | "DataBlock" => Some(InputKind::Block),
        "Stream" | "DataStream" => Some(InputKind::Stream),
        "Reference" => Some(InputKind::Reference),
        "SelfReference" => Some(InputKind::SelfReference),
        _ => None,
    }
}

fn parameter_type(origin: &str) -> Option<ParameterType> {
    match origin {
        "str" | "String" | "Text" => Some(ParameterType::Text),
        "int" | "i64" | "Integer" => Some(ParameterType::Integer),
        "float" | "f64" | "Float" => Some(ParameterType::Float),
        "bool" | "Boolean" => Some(ParameterType::Boolean),
        "Json" | "dict" | "Dict" | "list" | "List" => Some(ParameterType::Json),
        _ => None,
    }
}

fn is_context(origin: &str) -> bool {
    matches!(origin, "FunctionContext" | "Context" | "ExecutionContext")
}

fn bad_annotation(parameter: &str, message: impl Into<String>) -> BlockflowError {
    BlockflowError::BadAnnotation {
        parameter: parameter.to_string(),
        message: message.into(),
    }
}

/// Classify a signature into a [`FunctionInterface`].
pub fn extract_interface(signature: &Signature) -> Result<FunctionInterface> {
    let mut interface = FunctionInterface::default();
    let mut unannotated_input: Option<&str> = None;

    for param in &signature.params {
        let text = match &param.annotation {
            Some(text) => text,
            None => {
                if CONTEXT_PARAM_NAMES.contains(&param.name.as_str()) {
                    interface.uses_context = true;
                    continue;
                }
                if let Some(first) = unannotated_input {
                    return Err(BlockflowError::InterfaceDeclaration(format!(
                        "at most one parameter may be unannotated, found '{}' and '{}'",
                        first, param.name
                    )));
                }
                unannotated_input = Some(&param.name);
                interface.inputs.push(InputDef {
                    name: param.name.clone(),
                    kind: InputKind::Block,
                    schema_key: ANY_SCHEMA_KEY.to_string(),
                    required: true,
                    description: None,
                });
                continue;
            }
        };

        let ann = parse_annotation(text)
            .ok_or_else(|| bad_annotation(&param.name, format!("cannot parse '{}'", text)))?;

        if is_context(&ann.origin) {
            interface.uses_context = true;
        } else if let Some(kind) = input_kind(&ann.origin) {
            interface.inputs.push(InputDef {
                name: param.name.clone(),
                kind,
                schema_key: ann.arg.unwrap_or_else(|| ANY_SCHEMA_KEY.to_string()),
                required: !ann.optional,
                description: None,
            });
        } else if let Some(param_type) = parameter_type(&ann.origin) {
            if ann.arg.is_some() {
                return Err(bad_annotation(
                    &param.name,
                    format!("parameter type '{}' takes no type argument", ann.origin),
                ));
            }
            if let Some(default) = &param.default {
                if !default.is_null() && !param_type.accepts(default) {
                    return Err(bad_annotation(
                        &param.name,
                        format!("default {} is not a valid {:?}", default, param_type),
                    ));
                }
            }
            interface.parameters.push(ParameterDef {
                name: param.name.clone(),
                param_type,
                required: !ann.optional && param.default.is_none(),
                default: param.default.clone(),
            });
        } else {
            return Err(bad_annotation(
                &param.name,
                format!("unknown type '{}'", ann.origin),
            ));
        }
    }

    interface.outputs = extract_outputs(signature.returns.as_deref())?;
    Ok(interface)
}

fn extract_outputs(returns: Option<&str>) -> Result<Vec<OutputDef>> {
    let text = match returns.map(str::trim) {
        None => return Ok(vec![default_output(ANY_SCHEMA_KEY, false)]),
        Some("None") => return Ok(vec![]),
        Some(text) => text,
    };

    let (inner, is_iterator) = match iterator_re().captures(text) {
        Some(caps) => (caps.get(1).map(|m| m.as_str().trim()).unwrap_or(text), true),
        None => (text, false),
    };

    let ann = parse_annotation(inner)
        .ok_or_else(|| bad_annotation("return", format!("cannot parse '{}'", text)))?;
    let schema_key = match input_kind(&ann.origin) {
        Some(InputKind::Block) | Some(InputKind::Stream) => {
            ann.arg.unwrap_or_else(|| ANY_SCHEMA_KEY.to_string())
        }
        Some(_) => {
            return Err(bad_annotation(
                "return",
                format!("'{}' is not a valid output type", ann.origin),
            ))
        }
        // A bare name is the output schema itself
        None if ann.arg.is_none() => ann.origin,
        None => {
            return Err(bad_annotation(
                "return",
                format!("unknown output type '{}'", ann.origin),
            ))
        }
    };
    Ok(vec![default_output(&schema_key, is_iterator)])
}

fn default_output(schema_key: &str, is_iterator: bool) -> OutputDef {
    OutputDef {
        name: DEFAULT_OUTPUT_NAME.to_string(),
        schema_key: schema_key.to_string(),
        is_iterator,
        is_default: true,
    }
}
