use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use blockflow_core::error::Result;
use blockflow_core::storage::DataFormat;
use blockflow_core::traits::BlockReader;
use blockflow_core::types::{BlockId, ManagedBlock, Records};

use crate::interface::{extract_interface, FunctionInterface, Signature};

/// What a function call produced.
pub enum Output {
    /// Nothing this cycle.
    None,
    Records(Records),
    /// A finite lazy sequence of record batches, drained after the call.
    Iter(Box<dyn Iterator<Item = anyhow::Result<Records>> + Send>),
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("Output::None"),
            Self::Records(r) => write!(f, "Output::Records({} rows)", r.len()),
            Self::Iter(_) => f.write_str("Output::Iter(..)"),
        }
    }
}

/// Processing function body.
pub trait DataFunction: Send + Sync + 'static {
    fn call(&self, args: &mut FunctionArgs<'_>) -> anyhow::Result<Output>;
}

struct FnFunction<F>(F);

impl<F> DataFunction for FnFunction<F>
where
    F: Fn(&mut FunctionArgs<'_>) -> anyhow::Result<Output> + Send + Sync + 'static,
{
    fn call(&self, args: &mut FunctionArgs<'_>) -> anyhow::Result<Output> {
        (self.0)(args)
    }
}

/// A registered function: key, interface and implementation.
#[derive(Clone)]
pub struct FunctionDef {
    pub namespace: String,
    pub name: String,
    pub description: Option<String>,
    pub interface: FunctionInterface,
    function: Arc<dyn DataFunction>,
}

impl FunctionDef {
    /// Define a function from a closure.
    pub fn new<F>(namespace: &str, name: &str, signature: Signature, f: F) -> Result<Self>
    where
        F: Fn(&mut FunctionArgs<'_>) -> anyhow::Result<Output> + Send + Sync + 'static,
    {
        Self::from_impl(namespace, name, signature, FnFunction(f))
    }

    pub fn from_impl(
        namespace: &str,
        name: &str,
        signature: Signature,
        function: impl DataFunction,
    ) -> Result<Self> {
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            description: None,
            interface: extract_interface(&signature)?,
            function: Arc::new(function),
        })
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Declared parameter defaults overridden by `node_params`.
    pub fn resolve_params(
        &self,
        node_params: &serde_json::Map<String, Value>,
    ) -> serde_json::Map<String, Value> {
        let mut params = serde_json::Map::new();
        for p in &self.interface.parameters {
            if let Some(default) = &p.default {
                params.insert(p.name.clone(), default.clone());
            }
        }
        for (k, v) in node_params {
            params.insert(k.clone(), v.clone());
        }
        params
    }

    pub fn call(&self, args: &mut FunctionArgs<'_>) -> anyhow::Result<Output> {
        self.function.call(args)
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("key", &self.key())
            .field("interface", &self.interface)
            .finish()
    }
}

/// A block materialized for a function.
#[derive(Debug, Clone)]
pub struct InputBlock {
    pub block: ManagedBlock,
    pub records: Records,
}

impl InputBlock {
    pub fn id(&self) -> &BlockId {
        self.block.id()
    }

    pub fn into_records(self) -> Records {
        self.records
    }
}

/// Ids of stream blocks handed to a function, shared with the executor.
#[derive(Debug, Clone, Default)]
pub struct ConsumedBlocks(Arc<Mutex<Vec<BlockId>>>);

impl ConsumedBlocks {
    fn mark(&self, id: &BlockId) {
        if let Ok(mut ids) = self.0.lock() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
    }

    pub fn ids(&self) -> Vec<BlockId> {
        self.0.lock().map(|ids| ids.clone()).unwrap_or_default()
    }
}

/// Lazy, restartable sequence over unprocessed blocks, oldest first.
///
/// A block counts as consumed once it has been yielded.
pub struct BlockStream {
    blocks: Vec<ManagedBlock>,
    position: usize,
    reader: Arc<dyn BlockReader>,
    consumed: ConsumedBlocks,
}

impl BlockStream {
    pub fn new(blocks: Vec<ManagedBlock>, reader: Arc<dyn BlockReader>) -> Self {
        Self {
            blocks,
            position: 0,
            reader,
            consumed: ConsumedBlocks::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id().clone()).collect()
    }

    /// Start again from the first block.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn consumed(&self) -> ConsumedBlocks {
        self.consumed.clone()
    }

    /// Read every remaining block and concatenate their rows.
    pub fn read_all(&mut self) -> Result<Records> {
        let mut rows = Records::new();
        for block in self.by_ref() {
            rows.extend(block?.records);
        }
        Ok(rows)
    }
}

impl Iterator for BlockStream {
    type Item = Result<InputBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.blocks.get(self.position)?.clone();
        self.position += 1;
        let result = self.reader.read_block(&block).map(|records| {
            self.consumed.mark(block.id());
            InputBlock { block, records }
        });
        Some(result)
    }
}

impl fmt::Debug for BlockStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStream")
            .field("blocks", &self.blocks.len())
            .field("position", &self.position)
            .finish()
    }
}

/// A value bound to one declared input.
#[derive(Debug)]
pub enum BoundInput {
    Block(InputBlock),
    Stream(BlockStream),
    /// `None` when the referenced node has no output yet.
    Reference(Option<InputBlock>),
}

/// Options for [`ExecutionContext::emit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitOptions {
    pub output: Option<String>,
    pub storage: Option<String>,
    pub format: Option<DataFormat>,
    pub schema: Option<String>,
}

impl EmitOptions {
    pub fn output(mut self, name: &str) -> Self {
        self.output = Some(name.to_string());
        self
    }

    pub fn storage(mut self, url: &str) -> Self {
        self.storage = Some(url.to_string());
        self
    }

    pub fn format(mut self, format: DataFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn schema(mut self, key: &str) -> Self {
        self.schema = Some(key.to_string());
        self
    }
}

/// Engine surface exposed to functions that declare a context.
pub trait ExecutionContext {
    fn node_key(&self) -> &str;

    fn get_param(&self, name: &str, default: Value) -> Value;

    fn get_state_value(&self, key: &str, default: Value) -> Value;

    fn emit_state_value(&mut self, key: &str, value: Value);

    /// Write `records` to an output block of this run. Repeated emits to
    /// the same output extend the same block.
    fn emit(&mut self, records: Records, options: EmitOptions) -> Result<()>;

    /// False once the run's wall-clock budget is spent.
    fn should_continue(&self) -> bool;
}

/// Arguments handed to [`DataFunction::call`].
pub struct FunctionArgs<'a> {
    inputs: HashMap<String, BoundInput>,
    params: serde_json::Map<String, Value>,
    context: Option<&'a mut dyn ExecutionContext>,
}

impl<'a> FunctionArgs<'a> {
    pub fn new(
        inputs: HashMap<String, BoundInput>,
        params: serde_json::Map<String, Value>,
        context: Option<&'a mut dyn ExecutionContext>,
    ) -> Self {
        Self {
            inputs,
            params,
            context,
        }
    }

    /// Take the block bound to a Block input.
    pub fn block(&mut self, name: &str) -> Option<InputBlock> {
        match self.inputs.remove(name)? {
            BoundInput::Block(b) => Some(b),
            other => {
                self.inputs.insert(name.to_string(), other);
                None
            }
        }
    }

    /// Take the stream bound to a Stream input.
    pub fn stream(&mut self, name: &str) -> Option<BlockStream> {
        match self.inputs.remove(name)? {
            BoundInput::Stream(s) => Some(s),
            other => {
                self.inputs.insert(name.to_string(), other);
                None
            }
        }
    }

    /// Take the block bound to a Reference input. `None` means no block is
    /// available, either because the input is unbound or its upstream has
    /// not produced anything.
    pub fn reference(&mut self, name: &str) -> Option<InputBlock> {
        match self.inputs.remove(name)? {
            BoundInput::Reference(r) => r,
            other => {
                self.inputs.insert(name.to_string(), other);
                None
            }
        }
    }

    /// Rows of whatever is bound to `name`, read eagerly. Empty when unbound.
    pub fn records(&mut self, name: &str) -> Result<Records> {
        match self.inputs.remove(name) {
            Some(BoundInput::Block(b)) | Some(BoundInput::Reference(Some(b))) => Ok(b.records),
            Some(BoundInput::Stream(mut s)) => s.read_all(),
            Some(BoundInput::Reference(None)) | None => Ok(Records::new()),
        }
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name).filter(|v| !v.is_null())
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(Value::as_str)
    }

    pub fn param_i64(&self, name: &str) -> Option<i64> {
        self.param(name).and_then(Value::as_i64)
    }

    pub fn params(&self) -> &serde_json::Map<String, Value> {
        &self.params
    }

    /// The execution context. Fails unless the function declared one.
    pub fn context(&mut self) -> anyhow::Result<&mut (dyn ExecutionContext + 'a)> {
        self.context
            .as_deref_mut()
            .ok_or_else(|| anyhow::anyhow!("function did not declare an execution context"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_core::types::{DataBlock, DEFAULT_OUTPUT_NAME};
    use serde_json::json;

    struct FixedReader;

    impl BlockReader for FixedReader {
        fn read_block(&self, block: &ManagedBlock) -> Result<Records> {
            let mut row = serde_json::Map::new();
            row.insert("block".into(), json!(block.id().as_str()));
            Ok(vec![row])
        }
    }

    fn managed() -> ManagedBlock {
        ManagedBlock {
            block: DataBlock::new("up", DEFAULT_OUTPUT_NAME),
            stored_blocks: vec![],
        }
    }

    #[test]
    fn test_stream_tracks_consumed_and_rewinds() {
        let blocks = vec![managed(), managed(), managed()];
        let ids: Vec<_> = blocks.iter().map(|b| b.id().clone()).collect();
        let mut stream = BlockStream::new(blocks, Arc::new(FixedReader));
        let consumed = stream.consumed();

        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.id(), &ids[0]);
        assert_eq!(consumed.ids(), vec![ids[0].clone()]);

        stream.rewind();
        let rows = stream.read_all().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(consumed.ids(), ids);
    }

    #[test]
    fn test_unread_stream_consumes_nothing() {
        let stream = BlockStream::new(vec![managed()], Arc::new(FixedReader));
        assert!(stream.consumed().ids().is_empty());
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn test_args_accessors() {
        let mut inputs = HashMap::new();
        inputs.insert("ref".to_string(), BoundInput::Reference(None));
        let mut params = serde_json::Map::new();
        params.insert("limit".into(), json!(5));
        let mut args = FunctionArgs::new(inputs, params, None);

        assert!(args.block("ref").is_none());
        assert!(args.is_bound("ref"));
        assert!(args.reference("ref").is_none());
        assert_eq!(args.param_i64("limit"), Some(5));
        assert!(args.context().is_err());
    }

    #[test]
    fn test_resolve_params_node_overrides_default() {
        let sig = Signature::new()
            .param_default("limit", "int", json!(10))
            .param_default("label", "str", json!("x"));
        let def = FunctionDef::new("test", "f", sig, |_args| Ok(Output::None)).unwrap();
        let mut node = serde_json::Map::new();
        node.insert("limit".into(), json!(3));
        let params = def.resolve_params(&node);
        assert_eq!(params["limit"], json!(3));
        assert_eq!(params["label"], json!("x"));
        assert_eq!(def.key(), "test.f");
    }
}
