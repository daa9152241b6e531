use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::poison::lock_vm;
use crate::{
    ClassId, FrameId, InvokeOptions, JdwpClient, JdwpError, JdwpEvent, JdwpValue, MethodRef,
    ObjectId, ObjectRef, StackFrameInfo, StopReason, StoppedEvent, SuspendPolicy, ThreadId,
    ThreadInfo, JAVA_LANG_OBJECT, JAVA_LANG_STRING,
};

const TO_STRING: &str = "toString";
const TO_STRING_SIG: &str = "()Ljava/lang/String;";
const CONSTRUCTOR: &str = "<init>";

/// Target-side behaviour of a scripted method.
///
/// Receives the mock VM, the receiver (`None` for static calls and
/// constructors' class-level dispatch) and the arguments.
pub type MockMethodHandler =
    Arc<dyn Fn(&mut MockVm, Option<ObjectId>, &[JdwpValue]) -> Result<JdwpValue, JdwpError> + Send + Sync>;

type ClassInitializer = Arc<dyn Fn(&mut MockVm, ClassId) + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub struct MockObject {
    pub runtime_type: String,
    /// Contents of a `java.lang.String`.
    pub string_value: Option<String>,
    /// What `toString()` produces: text, `null`, or the type of the thrown exception.
    pub to_string: Result<Option<String>, String>,
    pub fields: HashMap<String, JdwpValue>,
    pub elements: Vec<JdwpValue>,
}

impl MockObject {
    pub fn plain(runtime_type: impl Into<String>, to_string: impl Into<String>) -> Self {
        Self {
            runtime_type: runtime_type.into(),
            string_value: None,
            to_string: Ok(Some(to_string.into())),
            fields: HashMap::new(),
            elements: Vec::new(),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            runtime_type: JAVA_LANG_STRING.to_string(),
            string_value: Some(value.clone()),
            to_string: Ok(Some(value)),
            fields: HashMap::new(),
            elements: Vec::new(),
        }
    }

    pub fn with_to_string(mut self, to_string: Result<Option<String>, String>) -> Self {
        self.to_string = to_string;
        self
    }
}

/// Every channel call the mock observed, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    Threads,
    StackFrames(ThreadId),
    ThisObject { thread: ThreadId, frame: FrameId },
    VmSuspend,
    VmResume,
    SuspendThread(ThreadId),
    ResumeThread(ThreadId),
    ClassesByName(String),
    LoadClass(String),
    FindMethod { class_id: ClassId, name: String },
    InvokeMethod { thread: ThreadId, object: ObjectId, method: String },
    InvokeStatic { thread: ThreadId, class_id: ClassId, method: String },
    NewInstance { thread: ThreadId, class_id: ClassId },
    NewArray { element_type: String, len: usize },
    GetField { object: ObjectId, field: String },
    SetField { object: ObjectId, field: String },
    StringValue(ObjectId),
    DisableCollection(ObjectId),
    EnableCollection(ObjectId),
}

/// Shared in-memory VM state behind [`MockJdwpClient`].
pub struct MockVm {
    connected: bool,
    threads: Vec<ThreadInfo>,
    frames: HashMap<ThreadId, Vec<StackFrameInfo>>,
    this_objects: HashMap<(ThreadId, FrameId), JdwpValue>,
    vm_suspended: bool,
    suspended: BTreeSet<ThreadId>,
    classes: HashMap<String, ClassId>,
    class_names: HashMap<ClassId, String>,
    loadable: HashMap<String, ClassInitializer>,
    methods: HashMap<ClassId, Vec<MethodRef>>,
    handlers: HashMap<(ClassId, String), MockMethodHandler>,
    objects: HashMap<ObjectId, MockObject>,
    collection_disabled: BTreeMap<ObjectId, u32>,
    next_id: u64,
    calls: Vec<MockCall>,
    events: VecDeque<JdwpEvent>,
    failures: HashMap<String, VecDeque<JdwpError>>,
    delays: HashMap<String, Duration>,
}

impl Default for MockVm {
    fn default() -> Self {
        let mut vm = Self {
            connected: true,
            threads: Vec::new(),
            frames: HashMap::new(),
            this_objects: HashMap::new(),
            vm_suspended: false,
            suspended: BTreeSet::new(),
            classes: HashMap::new(),
            class_names: HashMap::new(),
            loadable: HashMap::new(),
            methods: HashMap::new(),
            handlers: HashMap::new(),
            objects: HashMap::new(),
            collection_disabled: BTreeMap::new(),
            next_id: 1,
            calls: Vec::new(),
            events: VecDeque::new(),
            failures: HashMap::new(),
            delays: HashMap::new(),
        };
        let object = vm.define_class(JAVA_LANG_OBJECT);
        vm.define_class(JAVA_LANG_STRING);
        vm.define_method(object, TO_STRING, TO_STRING_SIG, builtin_to_string);
        vm
    }
}

impl MockVm {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn define_class(&mut self, name: &str) -> ClassId {
        if let Some(id) = self.classes.get(name) {
            return *id;
        }
        let id = self.alloc_id();
        self.classes.insert(name.to_string(), id);
        self.class_names.insert(id, name.to_string());
        id
    }

    pub fn define_method(
        &mut self,
        class_id: ClassId,
        name: &str,
        signature: &str,
        handler: impl Fn(&mut MockVm, Option<ObjectId>, &[JdwpValue]) -> Result<JdwpValue, JdwpError>
            + Send
            + Sync
            + 'static,
    ) -> MethodRef {
        let method = MethodRef {
            class_id,
            method_id: self.alloc_id(),
            name: name.to_string(),
            signature: signature.to_string(),
        };
        self.methods.entry(class_id).or_default().push(method.clone());
        self.handlers
            .insert((class_id, name.to_string()), Arc::new(handler));
        method
    }

    pub fn insert_object(&mut self, object: MockObject) -> ObjectRef {
        let id = self.alloc_id();
        let runtime_type = object.runtime_type.clone();
        self.objects.insert(id, object);
        ObjectRef::new(id, runtime_type)
    }

    pub fn new_string(&mut self, value: impl Into<String>) -> ObjectRef {
        self.insert_object(MockObject::string(value))
    }

    pub fn object(&self, id: ObjectId) -> Result<&MockObject, JdwpError> {
        self.objects.get(&id).ok_or(JdwpError::InvalidObjectId(id))
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Result<&mut MockObject, JdwpError> {
        self.objects.get_mut(&id).ok_or(JdwpError::InvalidObjectId(id))
    }

    pub fn is_thread_suspended(&self, thread: ThreadId) -> bool {
        self.vm_suspended || self.suspended.contains(&thread)
    }

    fn take_failure(&mut self, key: &str) -> Result<(), JdwpError> {
        match self.failures.get_mut(key).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_connected(&self) -> Result<(), JdwpError> {
        if self.connected {
            Ok(())
        } else {
            Err(JdwpError::NotConnected)
        }
    }

    fn lookup_method(&self, class_id: ClassId, name: &str) -> Option<MethodRef> {
        let own = self
            .methods
            .get(&class_id)
            .and_then(|methods| methods.iter().find(|m| m.name == name))
            .cloned();
        own.or_else(|| {
            let object = self.classes.get(JAVA_LANG_OBJECT)?;
            self.methods
                .get(object)?
                .iter()
                .find(|m| m.name == name)
                .cloned()
        })
    }

    fn call_handler(
        &mut self,
        method: &MethodRef,
        receiver: Option<ObjectId>,
        args: &[JdwpValue],
    ) -> Result<JdwpValue, JdwpError> {
        let handler = self
            .handlers
            .get(&(method.class_id, method.name.clone()))
            .cloned()
            .ok_or_else(|| JdwpError::Other(format!("no mock handler for `{}`", method.name)))?;
        for arg in args {
            if let Some(id) = arg.object_id() {
                self.object(id)?;
            }
        }
        handler(self, receiver, args)
    }

    /// Throw a fresh exception object of `exception_type` from a handler.
    pub fn throw(&mut self, exception_type: &str) -> JdwpError {
        let exception = self.insert_object(MockObject::plain(exception_type, exception_type));
        JdwpError::InvocationException { exception }
    }
}

fn builtin_to_string(
    vm: &mut MockVm,
    receiver: Option<ObjectId>,
    _args: &[JdwpValue],
) -> Result<JdwpValue, JdwpError> {
    let id = receiver.ok_or_else(|| JdwpError::Other("toString needs a receiver".to_string()))?;
    let obj = vm.object(id)?;
    if obj.string_value.is_some() {
        return Ok(JdwpValue::Object(ObjectRef::new(id, JAVA_LANG_STRING)));
    }
    match obj.to_string.clone() {
        Ok(Some(text)) => Ok(JdwpValue::Object(vm.new_string(text))),
        Ok(None) => Ok(JdwpValue::Null),
        Err(exception_type) => Err(vm.throw(&exception_type)),
    }
}

/// Deterministic, in-memory JDWP test double.
///
/// Cloning yields another handle onto the same VM, so a test can keep one
/// handle for inspection while the debugger core owns the boxed client.
#[derive(Clone, Default)]
pub struct MockJdwpClient {
    vm: Arc<Mutex<MockVm>>,
}

impl MockJdwpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the shared VM state.
    pub fn with_vm<R>(&self, f: impl FnOnce(&mut MockVm) -> R) -> R {
        let mut vm = lock_vm(&self.vm, "MockJdwpClient::with_vm");
        f(&mut vm)
    }

    pub fn set_threads(&self, threads: Vec<ThreadInfo>) {
        self.with_vm(|vm| vm.threads = threads);
    }

    pub fn set_stack_frames(&self, thread_id: ThreadId, frames: Vec<StackFrameInfo>) {
        self.with_vm(|vm| {
            vm.frames.insert(thread_id, frames);
        });
    }

    pub fn set_this_object(&self, thread_id: ThreadId, frame_id: FrameId, value: JdwpValue) {
        self.with_vm(|vm| {
            vm.this_objects.insert((thread_id, frame_id), value);
        });
    }

    pub fn insert_object(&self, object: MockObject) -> ObjectRef {
        self.with_vm(|vm| vm.insert_object(object))
    }

    pub fn new_string(&self, value: impl Into<String>) -> ObjectRef {
        self.with_vm(|vm| vm.new_string(value))
    }

    pub fn define_class(&self, name: &str) -> ClassId {
        self.with_vm(|vm| vm.define_class(name))
    }

    pub fn define_method(
        &self,
        class_id: ClassId,
        name: &str,
        signature: &str,
        handler: impl Fn(&mut MockVm, Option<ObjectId>, &[JdwpValue]) -> Result<JdwpValue, JdwpError>
            + Send
            + Sync
            + 'static,
    ) -> MethodRef {
        self.with_vm(|vm| vm.define_method(class_id, name, signature, handler))
    }

    /// Allow `load_class` to define `name`, running `init` to populate it.
    pub fn set_loadable(
        &self,
        name: &str,
        init: impl Fn(&mut MockVm, ClassId) + Send + Sync + 'static,
    ) {
        self.with_vm(|vm| {
            vm.loadable.insert(name.to_string(), Arc::new(init));
        });
    }

    /// Halt `thread_id` and queue the matching stop event.
    pub fn stop(&self, thread_id: ThreadId, policy: SuspendPolicy) {
        self.with_vm(|vm| {
            match policy {
                SuspendPolicy::All => vm.vm_suspended = true,
                SuspendPolicy::EventThread => {
                    vm.suspended.insert(thread_id);
                }
            }
            vm.events.push_back(JdwpEvent::Stopped(StoppedEvent {
                reason: StopReason::Breakpoint,
                thread_id,
                suspend_policy: policy,
                request_id: 0,
            }));
        });
    }

    pub fn push_event(&self, event: JdwpEvent) {
        self.with_vm(|vm| vm.events.push_back(event));
    }

    /// Simulate the VM going away.
    pub fn disconnect(&self) {
        self.with_vm(|vm| {
            vm.connected = false;
            vm.events.push_back(JdwpEvent::VmDisconnected);
        });
    }

    /// Make the next call to the operation (or invoked method) named `key` fail.
    pub fn fail_next(&self, key: &str, err: JdwpError) {
        self.with_vm(|vm| {
            vm.failures.entry(key.to_string()).or_default().push_back(err);
        });
    }

    /// Sleep for `delay` whenever a method named `method` is invoked.
    pub fn set_invoke_delay(&self, method: &str, delay: Duration) {
        self.with_vm(|vm| {
            vm.delays.insert(method.to_string(), delay);
        });
    }

    /// Let the target GC reclaim `object_id` unless collection is disabled.
    pub fn collect_object(&self, object_id: ObjectId) -> bool {
        self.with_vm(|vm| {
            if vm.collection_disabled.contains_key(&object_id) {
                return false;
            }
            vm.objects.remove(&object_id).is_some()
        })
    }

    pub fn is_collection_disabled(&self, object_id: ObjectId) -> bool {
        self.with_vm(|vm| vm.collection_disabled.contains_key(&object_id))
    }

    pub fn is_thread_suspended(&self, thread_id: ThreadId) -> bool {
        self.with_vm(|vm| vm.is_thread_suspended(thread_id))
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.with_vm(|vm| vm.calls.clone())
    }

    /// Number of instance/static invocations of methods named `method`.
    pub fn invoke_count(&self, method: &str) -> usize {
        self.with_vm(|vm| {
            vm.calls
                .iter()
                .filter(|call| match call {
                    MockCall::InvokeMethod { method: m, .. }
                    | MockCall::InvokeStatic { method: m, .. } => m == method,
                    _ => false,
                })
                .count()
        })
    }

    fn record(&self, call: MockCall, key: &str) -> Result<(), JdwpError> {
        self.with_vm(|vm| {
            vm.calls.push(call);
            vm.check_connected()?;
            vm.take_failure(key)
        })
    }

    fn invoke(
        &self,
        call: MockCall,
        thread_id: ThreadId,
        receiver: Option<ObjectId>,
        method: &MethodRef,
        args: &[JdwpValue],
    ) -> Result<JdwpValue, JdwpError> {
        let delay = self.with_vm(|vm| vm.delays.get(&method.name).copied());
        self.record(call, &method.name)?;
        if let Some(delay) = delay {
            // Sleep without holding the VM lock so tests can observe state meanwhile.
            std::thread::sleep(delay);
        }
        self.with_vm(|vm| {
            vm.check_connected()?;
            if !vm.is_thread_suspended(thread_id) {
                return Err(JdwpError::ThreadNotSuspended(thread_id));
            }
            if let Some(id) = receiver {
                vm.object(id)?;
            }
            vm.call_handler(method, receiver, args)
        })
    }
}

impl JdwpClient for MockJdwpClient {
    fn is_connected(&self) -> bool {
        self.with_vm(|vm| vm.connected)
    }

    fn dispose(&mut self) {
        self.with_vm(|vm| vm.connected = false);
    }

    fn threads(&mut self) -> Result<Vec<ThreadInfo>, JdwpError> {
        self.record(MockCall::Threads, "threads")?;
        Ok(self.with_vm(|vm| vm.threads.clone()))
    }

    fn stack_frames(&mut self, thread_id: ThreadId) -> Result<Vec<StackFrameInfo>, JdwpError> {
        self.record(MockCall::StackFrames(thread_id), "stack_frames")?;
        self.with_vm(|vm| match vm.frames.get(&thread_id) {
            Some(frames) => Ok(frames.clone()),
            None => Err(JdwpError::Other(format!(
                "no mock stack frames configured for thread {thread_id}"
            ))),
        })
    }

    fn this_object(&mut self, thread_id: ThreadId, frame_id: FrameId) -> Result<JdwpValue, JdwpError> {
        self.record(
            MockCall::ThisObject {
                thread: thread_id,
                frame: frame_id,
            },
            "this_object",
        )?;
        self.with_vm(|vm| {
            if !vm.is_thread_suspended(thread_id) {
                return Err(JdwpError::ThreadNotSuspended(thread_id));
            }
            Ok(vm
                .this_objects
                .get(&(thread_id, frame_id))
                .cloned()
                .unwrap_or(JdwpValue::Null))
        })
    }

    fn vm_suspend(&mut self) -> Result<(), JdwpError> {
        self.record(MockCall::VmSuspend, "vm_suspend")?;
        self.with_vm(|vm| vm.vm_suspended = true);
        Ok(())
    }

    fn vm_resume(&mut self) -> Result<(), JdwpError> {
        self.record(MockCall::VmResume, "vm_resume")?;
        self.with_vm(|vm| {
            vm.vm_suspended = false;
            vm.suspended.clear();
        });
        Ok(())
    }

    fn suspend_thread(&mut self, thread_id: ThreadId) -> Result<(), JdwpError> {
        self.record(MockCall::SuspendThread(thread_id), "suspend_thread")?;
        self.with_vm(|vm| vm.suspended.insert(thread_id));
        Ok(())
    }

    fn resume_thread(&mut self, thread_id: ThreadId) -> Result<(), JdwpError> {
        self.record(MockCall::ResumeThread(thread_id), "resume_thread")?;
        self.with_vm(|vm| vm.suspended.remove(&thread_id));
        Ok(())
    }

    fn classes_by_name(&mut self, name: &str) -> Result<Vec<ClassId>, JdwpError> {
        self.record(MockCall::ClassesByName(name.to_string()), "classes_by_name")?;
        Ok(self.with_vm(|vm| vm.classes.get(name).copied().into_iter().collect()))
    }

    fn load_class(
        &mut self,
        thread_id: ThreadId,
        name: &str,
        _class_loader: Option<ObjectId>,
    ) -> Result<ClassId, JdwpError> {
        self.record(MockCall::LoadClass(name.to_string()), "load_class")?;
        self.with_vm(|vm| {
            if !vm.is_thread_suspended(thread_id) {
                return Err(JdwpError::ThreadNotSuspended(thread_id));
            }
            if let Some(id) = vm.classes.get(name) {
                return Ok(*id);
            }
            let Some(init) = vm.loadable.get(name).cloned() else {
                return Err(JdwpError::ClassNotLoaded {
                    class_name: name.to_string(),
                });
            };
            let id = vm.define_class(name);
            init(vm, id);
            Ok(id)
        })
    }

    fn find_method(
        &mut self,
        class_id: ClassId,
        name: &str,
        signature: &str,
    ) -> Result<Option<MethodRef>, JdwpError> {
        self.record(
            MockCall::FindMethod {
                class_id,
                name: name.to_string(),
            },
            "find_method",
        )?;
        Ok(self.with_vm(|vm| {
            vm.lookup_method(class_id, name)
                .filter(|m| m.signature == signature)
        }))
    }

    fn invoke_method(
        &mut self,
        thread_id: ThreadId,
        object_id: ObjectId,
        method: &MethodRef,
        args: &[JdwpValue],
        _options: InvokeOptions,
    ) -> Result<JdwpValue, JdwpError> {
        let call = MockCall::InvokeMethod {
            thread: thread_id,
            object: object_id,
            method: method.name.clone(),
        };
        self.invoke(call, thread_id, Some(object_id), method, args)
    }

    fn invoke_static(
        &mut self,
        thread_id: ThreadId,
        class_id: ClassId,
        method: &MethodRef,
        args: &[JdwpValue],
        _options: InvokeOptions,
    ) -> Result<JdwpValue, JdwpError> {
        let call = MockCall::InvokeStatic {
            thread: thread_id,
            class_id,
            method: method.name.clone(),
        };
        self.invoke(call, thread_id, None, method, args)
    }

    fn new_instance(
        &mut self,
        thread_id: ThreadId,
        class_id: ClassId,
        constructor: &MethodRef,
        args: &[JdwpValue],
        _options: InvokeOptions,
    ) -> Result<ObjectRef, JdwpError> {
        self.record(
            MockCall::NewInstance {
                thread: thread_id,
                class_id,
            },
            "new_instance",
        )?;
        self.with_vm(|vm| {
            if !vm.is_thread_suspended(thread_id) {
                return Err(JdwpError::ThreadNotSuspended(thread_id));
            }
            let class_name = vm
                .class_names
                .get(&class_id)
                .cloned()
                .ok_or_else(|| JdwpError::Other(format!("unknown class id {class_id}")))?;
            if constructor.name != CONSTRUCTOR {
                return Err(JdwpError::Other(format!(
                    "`{}` is not a constructor",
                    constructor.name
                )));
            }
            let obj = vm.insert_object(MockObject::plain(class_name.clone(), class_name));
            if vm.handlers.contains_key(&(class_id, CONSTRUCTOR.to_string())) {
                vm.call_handler(constructor, Some(obj.id), args)?;
            }
            Ok(obj)
        })
    }

    fn new_array(&mut self, element_type: &str, values: &[JdwpValue]) -> Result<ObjectRef, JdwpError> {
        self.record(
            MockCall::NewArray {
                element_type: element_type.to_string(),
                len: values.len(),
            },
            "new_array",
        )?;
        self.with_vm(|vm| {
            for value in values {
                if let Some(id) = value.object_id() {
                    vm.object(id)?;
                }
            }
            let runtime_type = format!("{element_type}[]");
            let mut array = MockObject::plain(runtime_type.clone(), runtime_type);
            array.elements = values.to_vec();
            Ok(vm.insert_object(array))
        })
    }

    fn get_field(&mut self, object_id: ObjectId, field: &str) -> Result<JdwpValue, JdwpError> {
        self.record(
            MockCall::GetField {
                object: object_id,
                field: field.to_string(),
            },
            "get_field",
        )?;
        self.with_vm(|vm| {
            vm.object(object_id)?
                .fields
                .get(field)
                .cloned()
                .ok_or_else(|| JdwpError::Other(format!("no field `{field}`")))
        })
    }

    fn set_field(&mut self, object_id: ObjectId, field: &str, value: JdwpValue) -> Result<(), JdwpError> {
        self.record(
            MockCall::SetField {
                object: object_id,
                field: field.to_string(),
            },
            "set_field",
        )?;
        self.with_vm(|vm| {
            vm.object_mut(object_id)?.fields.insert(field.to_string(), value);
            Ok(())
        })
    }

    fn string_value(&mut self, string_id: ObjectId) -> Result<String, JdwpError> {
        self.record(MockCall::StringValue(string_id), "string_value")?;
        self.with_vm(|vm| {
            vm.object(string_id)?
                .string_value
                .clone()
                .ok_or_else(|| JdwpError::Other(format!("object {string_id} is not a string")))
        })
    }

    fn disable_collection(&mut self, object_id: ObjectId) -> Result<(), JdwpError> {
        self.record(MockCall::DisableCollection(object_id), "disable_collection")?;
        self.with_vm(|vm| {
            vm.object(object_id)?;
            *vm.collection_disabled.entry(object_id).or_insert(0) += 1;
            Ok(())
        })
    }

    fn enable_collection(&mut self, object_id: ObjectId) -> Result<(), JdwpError> {
        self.record(MockCall::EnableCollection(object_id), "enable_collection")?;
        self.with_vm(|vm| {
            vm.object(object_id)?;
            if let Some(count) = vm.collection_disabled.get_mut(&object_id) {
                *count -= 1;
                if *count == 0 {
                    vm.collection_disabled.remove(&object_id);
                }
            }
            Ok(())
        })
    }

    fn poll_event(&mut self) -> Result<Option<JdwpEvent>, JdwpError> {
        Ok(self.with_vm(|vm| vm.events.pop_front()))
    }
}
