//! Remote-control channel façade for Nova's debugger core.
//!
//! `nova-debug-eval` consumes this crate to talk to the target JVM: suspend and
//! resume threads, read frames, invoke methods, read/write fields and create
//! objects. The channel is `Send` but deliberately not `Sync`; it is owned by
//! exactly one manager thread at a time.
//!
//! Only the interface and an in-memory test double ([`MockJdwpClient`]) live
//! here. Wire-level transports plug in by implementing [`JdwpClient`].

mod mock;
mod poison;

use thiserror::Error;

pub use mock::{MockCall, MockJdwpClient, MockMethodHandler, MockObject, MockVm};

pub type ThreadId = u64;
pub type FrameId = u64;
pub type ObjectId = u64;
pub type ClassId = u64;
pub type MethodId = u64;

pub const JAVA_LANG_STRING: &str = "java.lang.String";
pub const JAVA_LANG_OBJECT: &str = "java.lang.Object";

#[derive(Clone, Debug, PartialEq)]
pub enum JdwpValue {
    Null,
    Void,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Object(ObjectRef),
}

impl JdwpValue {
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::Object(obj) => Some(obj.id),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::Object(obj) if obj.is_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub runtime_type: String,
}

impl ObjectRef {
    pub fn new(id: ObjectId, runtime_type: impl Into<String>) -> Self {
        Self {
            id,
            runtime_type: runtime_type.into(),
        }
    }

    pub fn is_string(&self) -> bool {
        self.runtime_type == JAVA_LANG_STRING
    }
}

/// A resolved method inside a loaded class.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub class_id: ClassId,
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
}

/// JDWP `INVOKE_*` option bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    /// Only resume the invoking thread while the method runs.
    pub single_threaded: bool,
    /// Call the exact method, bypassing virtual dispatch.
    pub nonvirtual: bool,
}

impl InvokeOptions {
    pub const INVOKE_SINGLE_THREADED: u32 = 0x01;
    pub const INVOKE_NONVIRTUAL: u32 = 0x02;

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.single_threaded {
            bits |= Self::INVOKE_SINGLE_THREADED;
        }
        if self.nonvirtual {
            bits |= Self::INVOKE_NONVIRTUAL;
        }
        bits
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrameInfo {
    pub id: FrameId,
    pub name: String,
    pub source_path: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
    Exception,
    Other,
}

/// Which threads the JVM halted for a stop event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPolicy {
    /// Every thread in the VM is suspended (`SUSPEND_ALL`).
    All,
    /// Only the thread that reported the event is suspended.
    EventThread,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoppedEvent {
    pub reason: StopReason,
    pub thread_id: ThreadId,
    pub suspend_policy: SuspendPolicy,
    /// JDWP event request id that produced this stop (if known).
    pub request_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JdwpEvent {
    Stopped(StoppedEvent),
    VmDisconnected,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum JdwpError {
    #[error("JDWP client is not connected")]
    NotConnected,
    #[error("JDWP operation not implemented")]
    NotImplemented,
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("JDWP command failed with error code {error_code}")]
    CommandFailed { error_code: u16 },
    #[error("invalid object id {0}")]
    InvalidObjectId(ObjectId),
    #[error("class {class_name} is not loaded in the target VM")]
    ClassNotLoaded { class_name: String },
    #[error("method invocation threw {}", exception.runtime_type)]
    InvocationException { exception: ObjectRef },
    #[error("thread {0} is not suspended")]
    ThreadNotSuspended(ThreadId),
    #[error("{0}")]
    Other(String),
}

impl JdwpError {
    /// Errors after which the channel cannot be used any more.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, JdwpError::NotConnected)
    }
}

/// Minimal, mock-friendly interface to the target VM.
///
/// Implementations are not expected to be safe for concurrent use; callers
/// must serialize every call through a single owner.
pub trait JdwpClient: Send {
    fn is_connected(&self) -> bool;

    /// Drop the underlying transport. Further calls fail with
    /// [`JdwpError::NotConnected`].
    fn dispose(&mut self);

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, JdwpError>;
    fn stack_frames(&mut self, thread_id: ThreadId) -> Result<Vec<StackFrameInfo>, JdwpError>;

    /// The `this` object of a frame, or [`JdwpValue::Null`] for static frames.
    fn this_object(&mut self, thread_id: ThreadId, frame_id: FrameId)
        -> Result<JdwpValue, JdwpError>;

    fn vm_suspend(&mut self) -> Result<(), JdwpError>;
    fn vm_resume(&mut self) -> Result<(), JdwpError>;
    fn suspend_thread(&mut self, thread_id: ThreadId) -> Result<(), JdwpError>;
    fn resume_thread(&mut self, thread_id: ThreadId) -> Result<(), JdwpError>;

    fn classes_by_name(&mut self, name: &str) -> Result<Vec<ClassId>, JdwpError>;

    /// Load (or define) `name` in the target through `class_loader`, running
    /// class initialization on `thread_id`.
    fn load_class(
        &mut self,
        _thread_id: ThreadId,
        _name: &str,
        _class_loader: Option<ObjectId>,
    ) -> Result<ClassId, JdwpError> {
        Err(JdwpError::NotImplemented)
    }

    fn find_method(
        &mut self,
        class_id: ClassId,
        name: &str,
        signature: &str,
    ) -> Result<Option<MethodRef>, JdwpError>;

    fn invoke_method(
        &mut self,
        thread_id: ThreadId,
        object_id: ObjectId,
        method: &MethodRef,
        args: &[JdwpValue],
        options: InvokeOptions,
    ) -> Result<JdwpValue, JdwpError>;

    fn invoke_static(
        &mut self,
        thread_id: ThreadId,
        class_id: ClassId,
        method: &MethodRef,
        args: &[JdwpValue],
        options: InvokeOptions,
    ) -> Result<JdwpValue, JdwpError>;

    fn new_instance(
        &mut self,
        thread_id: ThreadId,
        class_id: ClassId,
        constructor: &MethodRef,
        args: &[JdwpValue],
        options: InvokeOptions,
    ) -> Result<ObjectRef, JdwpError>;

    /// Create an array of `element_type` in the target filled with `values`.
    fn new_array(&mut self, element_type: &str, values: &[JdwpValue])
        -> Result<ObjectRef, JdwpError>;

    fn get_field(&mut self, object_id: ObjectId, field: &str) -> Result<JdwpValue, JdwpError>;
    fn set_field(
        &mut self,
        object_id: ObjectId,
        field: &str,
        value: JdwpValue,
    ) -> Result<(), JdwpError>;

    fn string_value(&mut self, string_id: ObjectId) -> Result<String, JdwpError>;

    fn disable_collection(&mut self, object_id: ObjectId) -> Result<(), JdwpError>;
    fn enable_collection(&mut self, object_id: ObjectId) -> Result<(), JdwpError>;

    /// Non-blocking read of the next asynchronous event, if one is buffered.
    fn poll_event(&mut self) -> Result<Option<JdwpEvent>, JdwpError> {
        Ok(None)
    }
}
