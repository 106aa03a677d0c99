//! Sinks loaded from shared libraries.
//!
//! A plugin `lib<name>.so` exports a function named `tidal_sink_vtable`
//! returning a pointer to a static [`SinkVTable`]:
//!
//! ```c
//! struct tidal_sink_vtable {
//!     uint32_t abi_version;
//!     void*   (*create)(const char* params);
//!     void    (*destroy)(void* sink);
//!     int32_t (*deliver)(void* sink, const struct message* messages, uint32_t count);
//! };
//! ```
//!
//! `create` returns null on failure and `deliver` returns 0 on success.

use std::ffi::{c_char, c_void, CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tidal_proto::Message;

use crate::error::SinkError;
use crate::sink::Sink;

/// ABI version this build understands.
pub const SINK_ABI_VERSION: u32 = 1;

/// Name of the exported vtable accessor.
pub const VTABLE_SYMBOL: &[u8] = b"tidal_sink_vtable\0";

#[repr(C)]
pub struct SinkVTable {
    pub abi_version: u32,
    pub create: unsafe extern "C" fn(params: *const c_char) -> *mut c_void,
    pub destroy: unsafe extern "C" fn(sink: *mut c_void),
    pub deliver: unsafe extern "C" fn(sink: *mut c_void, messages: *const Message, count: u32) -> i32,
}

type VTableAccessor = unsafe extern "C" fn() -> *const SinkVTable;

/// Handle from `dlopen`, closed on drop.
struct Library(*mut c_void);

impl Library {
    fn open(path: &Path) -> Result<Self, SinkError> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| plugin_error(path, "path contains a NUL byte"))?;
        // SAFETY: cpath is a valid C string.
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(plugin_error(path, dl_error()));
        }
        Ok(Self(handle))
    }

    fn vtable(&self, path: &Path) -> Result<*const SinkVTable, SinkError> {
        // SAFETY: handle is open; the symbol name is NUL terminated.
        let sym = unsafe { libc::dlsym(self.0, VTABLE_SYMBOL.as_ptr() as *const c_char) };
        if sym.is_null() {
            return Err(plugin_error(path, "missing tidal_sink_vtable symbol"));
        }
        // SAFETY: the plugin contract defines the symbol as a VTableAccessor.
        let accessor: VTableAccessor = unsafe { std::mem::transmute(sym) };
        Ok(unsafe { accessor() })
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: handle came from dlopen and is closed once.
        unsafe {
            libc::dlclose(self.0);
        }
    }
}

fn dl_error() -> String {
    // SAFETY: dlerror returns null or a thread-local C string.
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            "unknown dlopen error".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

fn plugin_error(path: &Path, reason: impl Into<String>) -> SinkError {
    SinkError::Plugin {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// A sink implemented by a plugin.
pub struct PluginSink {
    name: String,
    vtable: *const SinkVTable,
    instance: *mut c_void,
    // Dropped after `instance` is destroyed.
    _library: Option<Library>,
}

// SAFETY: the plugin contract requires an instance to be usable from any
// thread as long as calls are not concurrent; `deliver` takes `&mut self`.
unsafe impl Send for PluginSink {}

impl PluginSink {
    /// Load `<dir>/lib<name>.so` and create an instance with `params`.
    pub fn load(dir: &Path, name: &str, params: &str) -> Result<Self, SinkError> {
        let path = dir.join(format!("lib{name}.so"));
        let library = Library::open(&path)?;
        let vtable = library.vtable(&path)?;
        // SAFETY: the vtable stays valid while the library is loaded.
        unsafe { Self::from_vtable(name, &path, vtable, params, Some(library)) }
    }

    /// # Safety
    /// `vtable` must be null or point to a vtable that outlives the sink.
    unsafe fn from_vtable(
        name: &str,
        path: &Path,
        vtable: *const SinkVTable,
        params: &str,
        library: Option<Library>,
    ) -> Result<Self, SinkError> {
        let Some(table) = vtable.as_ref() else {
            return Err(plugin_error(path, "tidal_sink_vtable returned null"));
        };
        if table.abi_version != SINK_ABI_VERSION {
            return Err(SinkError::AbiMismatch {
                path: path.display().to_string(),
                found: table.abi_version,
                expected: SINK_ABI_VERSION,
            });
        }

        let cparams = CString::new(params).map_err(|_| SinkError::params(name, "NUL byte in parameters"))?;
        let instance = (table.create)(cparams.as_ptr());
        if instance.is_null() {
            return Err(plugin_error(path, format!("create failed for params '{params}'")));
        }
        tracing::info!(plugin = %path.display(), "plugin sink loaded");

        Ok(Self {
            name: name.to_string(),
            vtable,
            instance,
            _library: library,
        })
    }

    fn table(&self) -> &SinkVTable {
        // SAFETY: checked non-null at construction; outlives self.
        unsafe { &*self.vtable }
    }
}

impl Sink for PluginSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, messages: &[Message]) -> Result<(), SinkError> {
        if messages.is_empty() {
            return Ok(());
        }
        // SAFETY: instance is live; the slice is valid for `len` records.
        let rc = unsafe { (self.table().deliver)(self.instance, messages.as_ptr(), messages.len() as u32) };
        if rc != 0 {
            return Err(SinkError::Delivery(format!("plugin '{}' returned {rc}", self.name)));
        }
        Ok(())
    }
}

impl Drop for PluginSink {
    fn drop(&mut self) {
        // SAFETY: instance was created by this vtable and is destroyed once.
        unsafe { (self.table().destroy)(self.instance) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    static DELIVERED: AtomicUsize = AtomicUsize::new(0);
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    static LAST_TIME: AtomicI64 = AtomicI64::new(0);

    struct Counter {
        fail: bool,
    }

    unsafe extern "C" fn create(params: *const c_char) -> *mut c_void {
        let params = CStr::from_ptr(params).to_string_lossy();
        if params == "refuse" {
            return std::ptr::null_mut();
        }
        Box::into_raw(Box::new(Counter { fail: params == "fail" })) as *mut c_void
    }

    unsafe extern "C" fn destroy(sink: *mut c_void) {
        drop(Box::from_raw(sink as *mut Counter));
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn deliver(sink: *mut c_void, messages: *const Message, count: u32) -> i32 {
        let counter = &*(sink as *const Counter);
        if counter.fail {
            return 7;
        }
        let messages = std::slice::from_raw_parts(messages, count as usize);
        DELIVERED.fetch_add(messages.len(), Ordering::SeqCst);
        if let Some(last) = messages.last() {
            LAST_TIME.store(last.time(), Ordering::SeqCst);
        }
        0
    }

    static VTABLE: SinkVTable = SinkVTable {
        abi_version: SINK_ABI_VERSION,
        create,
        destroy,
        deliver,
    };

    static OLD_VTABLE: SinkVTable = SinkVTable {
        abi_version: SINK_ABI_VERSION + 1,
        create,
        destroy,
        deliver,
    };

    fn load(table: &'static SinkVTable, params: &str) -> Result<PluginSink, SinkError> {
        // SAFETY: static vtable.
        unsafe { PluginSink::from_vtable("counter", Path::new("libcounter.so"), table, params, None) }
    }

    #[test]
    fn test_vtable_lifecycle() {
        let destroyed = DESTROYED.load(Ordering::SeqCst);
        {
            let mut sink = load(&VTABLE, "").unwrap();
            assert_eq!(sink.name(), "counter");
            sink.deliver(&[Message::heartbeat(3), Message::heartbeat(4)]).unwrap();
            assert!(DELIVERED.load(Ordering::SeqCst) >= 2);
            assert_eq!(LAST_TIME.load(Ordering::SeqCst), 4);

            let mut failing = load(&VTABLE, "fail").unwrap();
            assert!(matches!(
                failing.deliver(&[Message::heartbeat(1)]),
                Err(SinkError::Delivery(_))
            ));
        }
        assert!(DESTROYED.load(Ordering::SeqCst) >= destroyed + 2);
    }

    #[test]
    fn test_abi_mismatch_rejected() {
        let err = load(&OLD_VTABLE, "").err().unwrap();
        assert!(matches!(err, SinkError::AbiMismatch { found: 2, expected: 1, .. }));
    }

    #[test]
    fn test_create_failure_reported() {
        assert!(matches!(load(&VTABLE, "refuse"), Err(SinkError::Plugin { .. })));
    }

    #[test]
    fn test_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        let err = PluginSink::load(dir.path(), "absent", "").err().unwrap();
        assert!(err.to_string().contains("libabsent.so"));
    }
}
