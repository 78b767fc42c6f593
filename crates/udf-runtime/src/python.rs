//! Foreign UDF handle: CPython classes driven through the embedded
//! interpreter.
//!
//! Every interpreter entry (initialization, processing, releasing
//! interpreter-owned buffers) happens under [`Python::attach`], the
//! process-wide interpreter-exclusion token. Frame planes are exposed to
//! the UDF as zero-copy NumPy views; replacement arrays returned by the
//! UDF are wired back into the frame while keeping the interpreter-side
//! object alive.

use frame_core::{Frame, PixelBacking};
use ndarray::ArrayViewMut3;
use numpy::{PyArray3, PyArrayDyn, PyArrayMethods, PyUntypedArrayMethods};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyList, PyString, PyTuple};
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::handle::{UdfHandle, UdfOutcome};

/// Class name looked up inside the UDF module.
const UDF_CLASS: &str = "Udf";

/// A UDF implemented by a Python module defining a `Udf` class.
///
/// `process(frame_or_frames, meta)` receives a `(H, W, C)` uint8 array per
/// plane (a list of arrays for multi-plane frames) plus the metadata
/// document, and returns `(drop, replacement_or_None, meta_or_None)`.
pub struct PythonUdfHandle {
    name: String,
    instance: Option<Py<PyAny>>,
    process_fn: Option<Py<PyAny>>,
}

impl PythonUdfHandle {
    /// Import the dotted `module_path`, instantiate its `Udf` class with
    /// constructor arguments pulled from `config` by parameter name, and
    /// cache the instance and its `process` attribute.
    pub fn load(module_path: &str, config: &serde_json::Value) -> Result<Self, RuntimeError> {
        Python::attach(|py| {
            let module = py.import(module_path).map_err(|err| RuntimeError::UdfLoadFailed {
                name: module_path.to_string(),
                reason: py_err_reason(py, &err),
            })?;
            let class = module
                .getattr(UDF_CLASS)
                .map_err(|_| RuntimeError::UdfLoadFailed {
                    name: module_path.to_string(),
                    reason: format!("module defines no {UDF_CLASS} class"),
                })?;

            // Pull each constructor parameter from the UDF config by name.
            let kwargs = PyDict::new(py);
            let parameters = py
                .import("inspect")
                .and_then(|inspect| inspect.call_method1("signature", (&class,)))
                .and_then(|signature| signature.getattr("parameters"))
                .map_err(|err| RuntimeError::UdfInitFailed {
                    name: module_path.to_string(),
                    reason: py_err_reason(py, &err),
                })?;
            let names = parameters.try_iter().map_err(|err| RuntimeError::UdfInitFailed {
                name: module_path.to_string(),
                reason: py_err_reason(py, &err),
            })?;
            for name in names {
                let parameter: String = name
                    .and_then(|n| n.extract())
                    .map_err(|err| RuntimeError::UdfInitFailed {
                        name: module_path.to_string(),
                        reason: py_err_reason(py, &err),
                    })?;
                let value = config.get(&parameter).ok_or_else(|| RuntimeError::UdfInitFailed {
                    name: module_path.to_string(),
                    reason: format!("config key {parameter:?} required by the UDF is missing"),
                })?;
                let value = json_to_py(py, value).map_err(|err| RuntimeError::UdfInitFailed {
                    name: module_path.to_string(),
                    reason: py_err_reason(py, &err),
                })?;
                let _ = kwargs.set_item(parameter, value);
            }

            let instance =
                class
                    .call((), Some(&kwargs))
                    .map_err(|err| RuntimeError::UdfInitFailed {
                        name: module_path.to_string(),
                        reason: py_err_reason(py, &err),
                    })?;
            let process_fn =
                instance
                    .getattr("process")
                    .map_err(|_| RuntimeError::UdfInitFailed {
                        name: module_path.to_string(),
                        reason: "UDF object has no process() method".to_string(),
                    })?;
            debug!(module = module_path, "python UDF initialized");

            Ok(Self {
                name: module_path.to_string(),
                instance: Some(instance.unbind()),
                process_fn: Some(process_fn.unbind()),
            })
        })
    }

    fn process_error(&self, py: Python<'_>, err: PyErr) -> RuntimeError {
        RuntimeError::Process {
            name: self.name.clone(),
            reason: py_err_reason(py, &err),
        }
    }

    fn plain_error(&self, reason: impl Into<String>) -> RuntimeError {
        RuntimeError::Process {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl UdfHandle for PythonUdfHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, frame: &mut Frame) -> Result<UdfOutcome, RuntimeError> {
        Python::attach(|py| {
            let process_fn = self
                .process_fn
                .as_ref()
                .ok_or_else(|| self.plain_error("process() reference released"))?;

            let meta = envelope_doc_to_py(py, frame)
                .map_err(|err| self.process_error(py, err))?;

            // Zero-copy views over the plane buffers. The UDF may mutate
            // pixels in place but must not retain the views past return.
            let count = frame.frame_count();
            let mut views = Vec::with_capacity(count);
            for index in 0..count {
                let height = frame.height(index)? as usize;
                let width = frame.width(index)? as usize;
                let channels = frame.channels(index)? as usize;
                let bytes = frame.data_mut(index)?;
                // SAFETY: the shape matches the plane's byte length
                // (enforced at frame construction), and the frame outlives
                // the interpreter call that uses the view.
                let view = unsafe {
                    ArrayViewMut3::from_shape_ptr((height, width, channels), bytes.as_mut_ptr())
                };
                let array = unsafe { PyArray3::borrow_from_array(&view, py.None().into_bound(py)) };
                views.push(array.into_any());
            }
            let frames_obj: Bound<'_, PyAny> = if count == 1 {
                views.remove(0)
            } else {
                PyList::new(py, &views)
                    .map_err(|err| self.process_error(py, err))?
                    .into_any()
            };

            let result = process_fn
                .bind(py)
                .call1((frames_obj.clone(), meta))
                .map_err(|err| self.process_error(py, err))?;

            let tuple = result
                .downcast::<PyTuple>()
                .map_err(|_| self.plain_error("process() must return (drop, frame, meta)"))?;
            if tuple.len() != 3 {
                return Err(self.plain_error("process() must return a 3-tuple"));
            }
            let drop_flag: bool = tuple
                .get_item(0)
                .and_then(|flag| flag.extract())
                .map_err(|err| self.process_error(py, err))?;
            if drop_flag {
                return Ok(UdfOutcome::Drop);
            }

            let new_meta = tuple
                .get_item(2)
                .map_err(|err| self.process_error(py, err))?;
            if !new_meta.is_none() {
                let dict = new_meta
                    .downcast::<PyDict>()
                    .map_err(|_| self.plain_error("returned meta must be a dict"))?;
                merge_meta(frame, dict).map_err(|err| self.process_error(py, err))?;
            }

            let replacement = tuple
                .get_item(1)
                .map_err(|err| self.process_error(py, err))?;
            if replacement.is_none() {
                return Ok(UdfOutcome::Pass);
            }
            // The UDF handed back the object it was given: nothing to
            // rewire.
            if replacement.as_ptr() == frames_obj.as_ptr() {
                return Ok(UdfOutcome::Pass);
            }

            if let Ok(list) = replacement.downcast::<PyList>() {
                if list.len() != count {
                    return Err(self.plain_error(format!(
                        "replacement list has {} frames, expected {count}",
                        list.len()
                    )));
                }
                for (index, item) in list.iter().enumerate() {
                    self.rewire_plane(frame, index, &item)?;
                }
            } else {
                self.rewire_plane(frame, 0, &replacement)?;
            }
            Ok(UdfOutcome::Modified)
        })
    }
}

impl PythonUdfHandle {
    /// Replace plane `index` with an array returned by the UDF, keeping
    /// the interpreter-side object alive for as long as the plane needs
    /// its memory.
    fn rewire_plane(
        &self,
        frame: &mut Frame,
        index: usize,
        item: &Bound<'_, PyAny>,
    ) -> Result<(), RuntimeError> {
        let array = item
            .downcast::<PyArrayDyn<u8>>()
            .map_err(|_| self.plain_error("replacement frame must be a uint8 ndarray"))?;
        if array.ndim() != 3 {
            return Err(self.plain_error(format!(
                "replacement array must have 3 dimensions, not {}",
                array.ndim()
            )));
        }
        let shape = array.shape().to_vec();
        // SAFETY: contiguity is checked by as_slice; the backing below
        // keeps the array object alive while the bytes are referenced.
        let slice = unsafe { array.as_slice() }
            .map_err(|_| self.plain_error("replacement array must be C-contiguous"))?;
        let backing = PyArrayBacking {
            ptr: slice.as_ptr() as *mut u8,
            len: slice.len(),
            array: Some(array.clone().unbind().into_any()),
        };
        frame
            .set_data(
                index,
                backing,
                shape[1] as u32,
                shape[0] as u32,
                shape[2] as u32,
            )
            .map_err(RuntimeError::Frame)
    }
}

impl Drop for PythonUdfHandle {
    fn drop(&mut self) {
        // Release cached references in reverse acquisition order, under
        // the interpreter token.
        Python::attach(|py| {
            if let Some(process_fn) = self.process_fn.take() {
                drop(process_fn.into_bound(py));
            }
            if let Some(instance) = self.instance.take() {
                drop(instance.into_bound(py));
            }
        });
        debug!(module = self.name.as_str(), "python UDF released");
    }
}

/// Pixel backing that owns a reference to an interpreter-side array.
struct PyArrayBacking {
    ptr: *mut u8,
    len: usize,
    array: Option<Py<PyAny>>,
}

// SAFETY: the raw pointer targets the NumPy array's buffer, which stays
// valid while `array` holds a reference; access is serialized by the
// frame's single-owner discipline.
unsafe impl Send for PyArrayBacking {}
unsafe impl Sync for PyArrayBacking {}

impl PixelBacking for PyArrayBacking {
    fn bytes(&self) -> &[u8] {
        // SAFETY: ptr/len captured from a contiguity-checked slice of the
        // array `self.array` keeps alive.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for PyArrayBacking {
    fn drop(&mut self) {
        // The deleter re-enters the interpreter: dropping the reference
        // requires the exclusion token like every other interpreter call.
        if let Some(array) = self.array.take() {
            Python::attach(|py| drop(array.into_bound(py)));
        }
    }
}

/// Merge string/int/float/bool entries of a returned meta dict into the
/// frame's envelope, replacing existing keys.
fn merge_meta(frame: &mut Frame, dict: &Bound<'_, PyDict>) -> PyResult<()> {
    let envelope = frame.meta_data_mut();
    for (key, value) in dict.iter() {
        let key: String = key.extract()?;
        // bool is a subclass of int in Python; test it first.
        let mapped = if let Ok(flag) = value.downcast::<PyBool>() {
            msg_envelope::Value::Bool(flag.is_true())
        } else if let Ok(int) = value.extract::<i64>() {
            msg_envelope::Value::Int(int)
        } else if let Ok(float) = value.extract::<f64>() {
            msg_envelope::Value::Float(float)
        } else if let Ok(string) = value.extract::<String>() {
            msg_envelope::Value::String(string)
        } else {
            warn!(key = key.as_str(), "unsupported meta value type, skipping");
            continue;
        };
        let _ = envelope.remove(&key);
        let _ = envelope.put(key, mapped);
    }
    Ok(())
}

/// Render the envelope document as a Python dict.
fn envelope_doc_to_py<'py>(py: Python<'py>, frame: &Frame) -> PyResult<Bound<'py, PyDict>> {
    let doc = frame.meta_data().to_json();
    let obj = json_to_py(py, &doc)?;
    obj.into_bound(py).downcast_into::<PyDict>().map_err(PyErr::from)
}

fn json_to_py(py: Python<'_>, value: &serde_json::Value) -> PyResult<Py<PyAny>> {
    let obj = match value {
        serde_json::Value::Null => py.None(),
        serde_json::Value::Bool(flag) => PyBool::new(py, *flag).to_owned().into_any().unbind(),
        serde_json::Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                int.into_pyobject(py)?.into_any().unbind()
            } else {
                number
                    .as_f64()
                    .unwrap_or(f64::NAN)
                    .into_pyobject(py)?
                    .into_any()
                    .unbind()
            }
        }
        serde_json::Value::String(string) => PyString::new(py, string).into_any().unbind(),
        serde_json::Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(json_to_py(py, item)?)?;
            }
            list.into_any().unbind()
        }
        serde_json::Value::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, json_to_py(py, item)?)?;
            }
            dict.into_any().unbind()
        }
    };
    Ok(obj)
}

fn py_err_reason(py: Python<'_>, err: &PyErr) -> String {
    let traceback = err
        .traceback(py)
        .and_then(|tb| tb.format().ok())
        .unwrap_or_default();
    if traceback.is_empty() {
        err.to_string()
    } else {
        format!("{err}\n{traceback}")
    }
}
