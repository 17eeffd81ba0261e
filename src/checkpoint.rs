//! Reading and writing serialized parameter snapshots.
//!
//! Two containers are understood: PyTorch/Lightning zip-pickle archives
//! (`.ckpt`, `.pt`, `.pth`) and safetensors files. Both are flattened into a
//! [`StateDict`] of f32 tensors keyed by parameter name.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use candle_core::pickle::{self, Object, Stack};
use candle_core::DType;
use log::warn;
use safetensors::tensor::{Dtype, SafeTensors, View};

use crate::error::{Error, Result};

const STATE_DICT_KEY: &str = "state_dict";
const GLOBAL_STEP_KEY: &str = "global_step";
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

#[derive(Debug, Clone, PartialEq)]
pub struct TensorSnapshot {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorSnapshot {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        if shape.iter().product::<usize>() != values.len() {
            return Err(Error::TensorData(format!(
                "shape {:?} does not match {} values",
                shape,
                values.len()
            )));
        }
        Ok(Self { shape, values })
    }

    pub fn num_elements(&self) -> usize {
        self.values.len()
    }
}

/// Parameter name to tensor mapping. Merging into a model consumes entries.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: HashMap<String, TensorSnapshot>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: TensorSnapshot) {
        self.tensors.insert(key.into(), tensor);
    }

    pub fn get(&self, key: &str) -> Option<&TensorSnapshot> {
        self.tensors.get(key)
    }

    pub fn take(&mut self, key: &str) -> Option<TensorSnapshot> {
        self.tensors.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Keys in lexicographic order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.tensors.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub global_step: Option<u64>,
    pub state_dict: StateDict,
}

impl Checkpoint {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint not found"),
            ));
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => load_safetensors(path),
            _ if is_zip_archive(path)? => load_pickle(path),
            // a safetensors file saved under a torch-style name
            _ => load_safetensors(path),
        }
    }

    /// Writes the state dict as safetensors; the step counter goes into the
    /// header metadata.
    pub fn save_safetensors<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let metadata = self.global_step.map(|step| {
            let mut m = HashMap::new();
            m.insert(GLOBAL_STEP_KEY.to_string(), step.to_string());
            m
        });

        let ordered: BTreeMap<&str, &TensorSnapshot> = self
            .state_dict
            .tensors
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();

        safetensors::serialize_to_file(ordered, &metadata, path)
            .map_err(|e| Error::checkpoint(path, e))
    }
}

impl<'a> View for &'a TensorSnapshot {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Owned(self.values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    fn data_len(&self) -> usize {
        self.values.len() * std::mem::size_of::<f32>()
    }
}

fn is_zip_archive(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    Ok(file.read_exact(&mut magic).is_ok() && magic == ZIP_MAGIC)
}

fn load_safetensors(path: &Path) -> Result<Checkpoint> {
    let buffer = fs::read(path).map_err(|e| Error::io(path, e))?;

    let (_, metadata) =
        SafeTensors::read_metadata(&buffer).map_err(|e| Error::checkpoint(path, e))?;
    let global_step = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(GLOBAL_STEP_KEY))
        .and_then(|s| s.parse().ok());

    let tensors = SafeTensors::deserialize(&buffer).map_err(|e| Error::checkpoint(path, e))?;

    let mut state_dict = StateDict::new();
    for (name, view) in tensors.tensors() {
        let values = decode_values(view.dtype(), view.data())
            .ok_or_else(|| Error::checkpoint(path, format!("{}: unsupported dtype {:?}", name, view.dtype())))?;
        let snapshot = TensorSnapshot::new(view.shape().to_vec(), values)
            .map_err(|e| Error::checkpoint(path, format!("{}: {}", name, e)))?;
        state_dict.insert(name, snapshot);
    }

    Ok(Checkpoint {
        global_step,
        state_dict,
    })
}

fn decode_values(dtype: Dtype, bytes: &[u8]) -> Option<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::F64 => bytes
            .chunks_exact(8)
            .map(|b| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                f64::from_le_bytes(raw) as f32
            })
            .collect(),
        Dtype::I64 => bytes
            .chunks_exact(8)
            .map(|b| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                i64::from_le_bytes(raw) as f32
            })
            .collect(),
        _ => return None,
    };

    Some(values)
}

fn load_pickle(path: &Path) -> Result<Checkpoint> {
    // Lightning nests the weights under "state_dict"; plain torch.save dumps don't.
    let tensors = pickle::read_all_with_key(path, Some(STATE_DICT_KEY))
        .or_else(|_| pickle::read_all_with_key(path, None))
        .map_err(|e| Error::checkpoint(path, e))?;

    let mut state_dict = StateDict::new();
    for (name, tensor) in tensors {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| Error::checkpoint(path, format!("{}: {}", name, e)))?;
        let snapshot =
            TensorSnapshot::new(shape, values).map_err(|e| Error::checkpoint(path, format!("{}: {}", name, e)))?;
        state_dict.insert(name, snapshot);
    }

    let global_step = match read_global_step(path) {
        Ok(step) => step,
        Err(reason) => {
            warn!("Could not read global step from {}: {}", path.display(), reason);
            None
        }
    };

    Ok(Checkpoint {
        global_step,
        state_dict,
    })
}

fn read_global_step(path: &Path) -> std::result::Result<Option<u64>, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| e.to_string())?;

    let pickle_name = match archive.file_names().find(|n| n.ends_with("data.pkl")) {
        Some(name) => name.to_string(),
        None => return Ok(None),
    };
    let entry = archive.by_name(&pickle_name).map_err(|e| e.to_string())?;

    let mut stack = Stack::empty();
    stack
        .read_loop(&mut BufReader::new(entry))
        .map_err(|e| e.to_string())?;
    let root = stack.finalize().map_err(|e| e.to_string())?;

    let entries = match root {
        Object::Dict(entries) => entries,
        _ => return Ok(None),
    };

    Ok(entries.into_iter().find_map(|(key, value)| match (key, value) {
        (Object::Unicode(key), Object::Int(step)) if key == GLOBAL_STEP_KEY => u64::try_from(step).ok(),
        _ => None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(shape: &[usize], start: f32) -> TensorSnapshot {
        let n = shape.iter().product::<usize>();
        TensorSnapshot::new(shape.to_vec(), (0..n).map(|i| start + i as f32).collect()).unwrap()
    }

    #[test]
    fn safetensors_preserve_values_and_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let mut state_dict = StateDict::new();
        state_dict.insert("model.a.weight", snapshot(&[2, 3], 0.5));
        state_dict.insert("model.b.bias", snapshot(&[4], -2.0));
        let checkpoint = Checkpoint {
            global_step: Some(470000),
            state_dict,
        };
        checkpoint.save_safetensors(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.global_step, Some(470000));
        assert_eq!(loaded.state_dict.keys(), vec!["model.a.weight", "model.b.bias"]);
        assert_eq!(loaded.state_dict.get("model.a.weight"), Some(&snapshot(&[2, 3], 0.5)));
        assert_eq!(loaded.state_dict.get("model.b.bias"), Some(&snapshot(&[4], -2.0)));
    }

    #[test]
    fn missing_step_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let mut state_dict = StateDict::new();
        state_dict.insert("w", snapshot(&[1], 1.0));
        Checkpoint {
            global_step: None,
            state_dict,
        }
        .save_safetensors(&path)
        .unwrap();

        assert_eq!(Checkpoint::load(&path).unwrap().global_step, None);
    }

    #[test]
    fn snapshot_rejects_inconsistent_shape() {
        let err = TensorSnapshot::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, Error::TensorData(_)));
        assert_eq!(TensorSnapshot::new(vec![], vec![1.0]).unwrap().num_elements(), 1);
    }

    #[test]
    fn take_consumes_entries() {
        let mut state_dict = StateDict::new();
        state_dict.insert("x", snapshot(&[2], 0.0));

        assert!(state_dict.take("x").is_some());
        assert!(state_dict.take("x").is_none());
        assert!(state_dict.is_empty());
    }

    #[test]
    fn half_precision_is_widened() {
        let bytes: Vec<u8> = [1.5f32, -0.25]
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();

        assert_eq!(decode_values(Dtype::F16, &bytes), Some(vec![1.5, -0.25]));
        assert_eq!(decode_values(Dtype::BOOL, &[1]), None);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Checkpoint::load(dir.path().join("sd-v1-4.ckpt")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn safetensors_under_ckpt_name_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sd-v1-4.ckpt");

        let mut state_dict = StateDict::new();
        state_dict.insert("betas", snapshot(&[3], 0.1));
        Checkpoint {
            global_step: Some(7),
            state_dict,
        }
        .save_safetensors(&path)
        .unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.global_step, Some(7));
        assert!(loaded.state_dict.contains("betas"));
    }

    /// Minimal protocol-2 pickle writer for torch zip archives.
    #[derive(Default)]
    struct PickleWriter {
        out: Vec<u8>,
    }

    impl PickleWriter {
        fn op(&mut self, code: u8) -> &mut Self {
            self.out.push(code);
            self
        }

        fn unicode(&mut self, s: &str) -> &mut Self {
            self.out.push(b'X');
            self.out.extend((s.len() as u32).to_le_bytes());
            self.out.extend(s.as_bytes());
            self
        }

        fn small_int(&mut self, v: u8) -> &mut Self {
            self.out.extend([b'K', v]);
            self
        }

        fn int(&mut self, v: i32) -> &mut Self {
            self.out.push(b'J');
            self.out.extend(v.to_le_bytes());
            self
        }

        fn global(&mut self, module: &str, name: &str) -> &mut Self {
            self.out.push(b'c');
            self.out.extend(format!("{}\n{}\n", module, name).as_bytes());
            self
        }

        fn ordered_dict(&mut self) -> &mut Self {
            self.global("collections", "OrderedDict").op(b')').op(b'R')
        }

        fn small_tuple(&mut self, values: &[usize]) -> &mut Self {
            self.op(b'(');
            for v in values {
                self.small_int(*v as u8);
            }
            self.op(b't')
        }

        /// `_rebuild_tensor_v2` over a contiguous FloatStorage stored as `data/<storage>`.
        fn float_tensor(&mut self, storage: &str, shape: &[usize]) -> &mut Self {
            let numel = shape.iter().product::<usize>();
            let mut strides = vec![1; shape.len()];
            for i in (0..shape.len().saturating_sub(1)).rev() {
                strides[i] = strides[i + 1] * shape[i + 1];
            }

            self.global("torch._utils", "_rebuild_tensor_v2").op(b'(');
            self.op(b'(')
                .unicode("storage")
                .global("torch", "FloatStorage")
                .unicode(storage)
                .unicode("cpu")
                .small_int(numel as u8)
                .op(b't')
                .op(b'Q');
            self.small_int(0)
                .small_tuple(shape)
                .small_tuple(&strides)
                .op(0x89)
                .ordered_dict()
                .op(b't')
                .op(b'R')
        }
    }

    fn write_lightning_ckpt(path: &Path, global_step: i32, tensors: &[(&str, &[usize], Vec<f32>)]) {
        use std::io::Write;

        let mut pickle = PickleWriter::default();
        pickle.op(0x80).op(2).op(b'}').op(b'(');
        pickle.unicode(GLOBAL_STEP_KEY).int(global_step);
        pickle.unicode(STATE_DICT_KEY).ordered_dict().op(b'(');
        for (i, (name, shape, _)) in tensors.iter().enumerate() {
            pickle.unicode(name).float_tensor(&i.to_string(), shape);
        }
        pickle.op(b'u').op(b'u').op(b'.');

        let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        let mut archive = zip::ZipWriter::new(File::create(path).unwrap());
        archive.start_file("archive/data.pkl", options).unwrap();
        archive.write_all(&pickle.out).unwrap();
        for (i, (_, _, values)) in tensors.iter().enumerate() {
            archive.start_file(format!("archive/data/{}", i), options).unwrap();
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            archive.write_all(&bytes).unwrap();
        }
        archive.finish().unwrap();
    }

    #[test]
    fn lightning_ckpt_yields_state_dict_and_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sd-v1-4.ckpt");
        let weight = snapshot(&[2, 3], 0.5);
        let betas = snapshot(&[3], -1.0);
        write_lightning_ckpt(
            &path,
            470000,
            &[
                ("model.a.weight", &[2, 3][..], weight.values.clone()),
                ("betas", &[3][..], betas.values.clone()),
            ],
        );

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.global_step, Some(470000));
        assert_eq!(loaded.state_dict.keys(), vec!["betas", "model.a.weight"]);
        assert_eq!(loaded.state_dict.get("model.a.weight"), Some(&weight));
        assert_eq!(loaded.state_dict.get("betas"), Some(&betas));
    }

    #[test]
    fn garbage_ckpt_is_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sd-v1-4.ckpt");
        fs::write(&path, b"definitely not a zip archive").unwrap();

        let err = Checkpoint::load(&path).unwrap_err();
        assert!(matches!(err, Error::Checkpoint { .. }));
    }
}
