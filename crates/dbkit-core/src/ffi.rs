//! Thin, non-variadic shim over the embedded engine's C ABI.
//!
//! This module is the only place in the crate that calls into
//! `libsqlite3-sys` directly. Everything above it works with the safe types
//! in [`crate::value`], [`crate::row`], and [`crate::statement`].

use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr;
use std::sync::Arc;

use libsqlite3_sys as sys;

use crate::error::Error;
use crate::value::Value;

/// An open database handle.
///
/// A raw pointer has neither `Send` nor `Sync` by default. Both are
/// justified here by the serializer: every access goes through
/// [`crate::connection::ConnectionSerializer`]'s lock, which admits only
/// one caller at a time regardless of which thread it's on.
pub(crate) struct RawDb {
    handle: *mut sys::sqlite3,
    trace_ctx: Option<*mut c_void>,
}

unsafe impl Send for RawDb {}
unsafe impl Sync for RawDb {}

/// Trampoline registered with `sqlite3_trace_v2`; forwards `SQLITE_TRACE_STMT`
/// events (the unexpanded SQL text of each statement about to execute) to the
/// boxed closure stashed in `ctx` by [`RawDb::open`].
unsafe extern "C" fn trace_trampoline(
    event: c_uint,
    ctx: *mut c_void,
    _p: *mut c_void,
    x: *mut c_void,
) -> c_int {
    if event != sys::SQLITE_TRACE_STMT || ctx.is_null() || x.is_null() {
        return 0;
    }
    let callback = &*(ctx as *const Arc<dyn Fn(&str) + Send + Sync>);
    let sql = CStr::from_ptr(x as *const std::os::raw::c_char).to_string_lossy();
    callback(&sql);
    0
}

impl RawDb {
    pub(crate) fn open(
        path: &str,
        flags: c_int,
        vfs: Option<&str>,
        trace: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    ) -> Result<RawDb, Error> {
        let c_path = CString::new(path).map_err(|_| Error::Programmer("path contains a NUL"))?;
        let vfs_cstring = vfs
            .map(CString::new)
            .transpose()
            .map_err(|_| Error::Programmer("vfs name contains a NUL"))?;
        let vfs_ptr = vfs_cstring.as_ref().map_or(ptr::null(), |c| c.as_ptr());

        let mut db: *mut sys::sqlite3 = ptr::null_mut();
        let rc = unsafe { sys::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, vfs_ptr) };
        if rc != sys::SQLITE_OK {
            let err = last_error(db, rc);
            unsafe { sys::sqlite3_close(db) };
            return Err(err);
        }

        let trace_ctx = trace.map(|callback| {
            let boxed: Box<Arc<dyn Fn(&str) + Send + Sync>> = Box::new(callback);
            let ptr = Box::into_raw(boxed) as *mut c_void;
            unsafe {
                sys::sqlite3_trace_v2(db, sys::SQLITE_TRACE_STMT as u32, Some(trace_trampoline), ptr);
            }
            ptr
        });

        Ok(RawDb { handle: db, trace_ctx })
    }

    pub(crate) fn set_extended_result_codes(&self, enabled: bool) {
        unsafe {
            sys::sqlite3_extended_result_codes(self.handle, enabled as c_int);
        }
    }

    pub(crate) fn exec_pragma(&self, sql: &str) -> Result<(), Error> {
        let c_sql = CString::new(sql).map_err(|_| Error::Programmer("sql contains a NUL"))?;
        let rc = unsafe {
            sys::sqlite3_exec(
                self.handle,
                c_sql.as_ptr(),
                None,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if rc != sys::SQLITE_OK {
            return Err(last_error(self.handle, rc));
        }
        Ok(())
    }

    pub(crate) fn prepare(&self, sql: &str) -> Result<RawStmt, Error> {
        let c_sql = CString::new(sql).map_err(|_| Error::Programmer("sql contains a NUL"))?;
        let mut stmt: *mut sys::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const std::os::raw::c_char = ptr::null();
        let rc = unsafe {
            sys::sqlite3_prepare_v2(
                self.handle,
                c_sql.as_ptr(),
                -1,
                &mut stmt,
                &mut tail as *mut _,
            )
        };
        if rc != sys::SQLITE_OK {
            return Err(Error::Syntax {
                sql: sql.to_owned(),
                message: last_message(self.handle),
            });
        }
        Ok(RawStmt(stmt))
    }

    pub(crate) fn last_insert_rowid(&self) -> i64 {
        unsafe { sys::sqlite3_last_insert_rowid(self.handle) }
    }

    pub(crate) fn changes(&self) -> i64 {
        unsafe { sys::sqlite3_changes(self.handle) as i64 }
    }

    pub(crate) fn is_autocommit(&self) -> bool {
        unsafe { sys::sqlite3_get_autocommit(self.handle) != 0 }
    }

    pub(crate) fn as_ptr(&self) -> *mut sys::sqlite3 {
        self.handle
    }
}

impl Drop for RawDb {
    fn drop(&mut self) {
        unsafe {
            // sqlite3_close_v2 tolerates unfinalized statements left behind
            // by a caller that dropped a cursor early; sqlite3_close would
            // return SQLITE_BUSY in that case.
            sys::sqlite3_close_v2(self.handle);
            if let Some(ptr) = self.trace_ctx.take() {
                drop(Box::from_raw(ptr as *mut Arc<dyn Fn(&str) + Send + Sync>));
            }
        }
    }
}

/// A prepared statement handle.
pub(crate) struct RawStmt(pub(crate) *mut sys::sqlite3_stmt);

unsafe impl Send for RawStmt {}

/// Outcome of advancing a cursor one step.
pub(crate) enum StepResult {
    Row,
    Done,
}

impl RawStmt {
    pub(crate) fn bind(&self, index: c_int, value: &Value) -> Result<(), Error> {
        let rc = match value {
            Value::Null => unsafe { sys::sqlite3_bind_null(self.0, index) },
            Value::Integer(i) => unsafe { sys::sqlite3_bind_int64(self.0, index, *i) },
            Value::Real(r) => unsafe { sys::sqlite3_bind_double(self.0, index, *r) },
            Value::Text(s) => unsafe {
                sys::sqlite3_bind_text(
                    self.0,
                    index,
                    s.as_ptr() as *const std::os::raw::c_char,
                    s.len() as c_int,
                    sys::SQLITE_TRANSIENT(),
                )
            },
            Value::Blob(b) => unsafe {
                sys::sqlite3_bind_blob(
                    self.0,
                    index,
                    b.as_ptr() as *const std::os::raw::c_void,
                    b.len() as c_int,
                    sys::SQLITE_TRANSIENT(),
                )
            },
        };
        if rc != sys::SQLITE_OK {
            return Err(Error::Programmer("failed to bind statement argument"));
        }
        Ok(())
    }

    pub(crate) fn bind_name_index(&self, name: &str) -> Option<c_int> {
        let c_name = CString::new(name).ok()?;
        let idx = unsafe { sys::sqlite3_bind_parameter_index(self.0, c_name.as_ptr()) };
        if idx == 0 {
            None
        } else {
            Some(idx)
        }
    }

    pub(crate) fn param_count(&self) -> c_int {
        unsafe { sys::sqlite3_bind_parameter_count(self.0) }
    }

    pub(crate) fn step(&self, db: *mut sys::sqlite3) -> Result<StepResult, Error> {
        let rc = unsafe { sys::sqlite3_step(self.0) };
        match rc {
            sys::SQLITE_ROW => Ok(StepResult::Row),
            sys::SQLITE_DONE => Ok(StepResult::Done),
            _ => Err(last_error(db, rc)),
        }
    }

    pub(crate) fn reset(&self) {
        unsafe {
            sys::sqlite3_reset(self.0);
            sys::sqlite3_clear_bindings(self.0);
        }
    }

    pub(crate) fn column_count(&self) -> usize {
        unsafe { sys::sqlite3_column_count(self.0) as usize }
    }

    pub(crate) fn column_name(&self, index: usize) -> String {
        unsafe {
            let ptr = sys::sqlite3_column_name(self.0, index as c_int);
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }

    pub(crate) fn column_value(&self, index: usize) -> Value {
        let index = index as c_int;
        unsafe {
            match sys::sqlite3_column_type(self.0, index) {
                sys::SQLITE_NULL => Value::Null,
                sys::SQLITE_INTEGER => Value::Integer(sys::sqlite3_column_int64(self.0, index)),
                sys::SQLITE_FLOAT => Value::Real(sys::sqlite3_column_double(self.0, index)),
                sys::SQLITE_TEXT => {
                    let ptr = sys::sqlite3_column_text(self.0, index);
                    let len = sys::sqlite3_column_bytes(self.0, index) as usize;
                    if ptr.is_null() {
                        Value::Text(String::new())
                    } else {
                        let slice = std::slice::from_raw_parts(ptr, len);
                        Value::Text(String::from_utf8_lossy(slice).into_owned())
                    }
                }
                sys::SQLITE_BLOB => {
                    let ptr = sys::sqlite3_column_blob(self.0, index);
                    let len = sys::sqlite3_column_bytes(self.0, index) as usize;
                    if ptr.is_null() || len == 0 {
                        Value::Null
                    } else {
                        let slice =
                            std::slice::from_raw_parts(ptr as *const u8, len);
                        Value::Blob(slice.to_vec())
                    }
                }
                _ => Value::Null,
            }
        }
    }
}

impl Drop for RawStmt {
    fn drop(&mut self) {
        unsafe {
            sys::sqlite3_finalize(self.0);
        }
    }
}

pub(crate) fn last_message(db: *mut sys::sqlite3) -> String {
    unsafe {
        let ptr = sys::sqlite3_errmsg(db);
        if ptr.is_null() {
            String::from("unknown engine error")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

pub(crate) fn last_error(db: *mut sys::sqlite3, rc: c_int) -> Error {
    Error::Engine {
        code: rc as i32,
        message: last_message(db),
        sql: None,
    }
}

/// Default open flags: read/write, create if missing, the one serializing
/// connection owns its own handle so no shared-cache flag is needed.
pub(crate) fn default_open_flags(read_only: bool) -> c_int {
    if read_only {
        sys::SQLITE_OPEN_READONLY | sys::SQLITE_OPEN_NOMUTEX
    } else {
        sys::SQLITE_OPEN_READWRITE | sys::SQLITE_OPEN_CREATE | sys::SQLITE_OPEN_NOMUTEX
    }
}
