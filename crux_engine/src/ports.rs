//! Document-side ports. They live on the controlling thread only.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use crux_shared::{ControlValue, NodeDescriptor, PortDescriptor, PortKind, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Listener list shared by every port type.
struct Listeners<T> {
    next: Cell<u64>,
    callbacks: RefCell<BTreeMap<u64, Rc<dyn Fn(&T)>>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            next: Cell::new(0),
            callbacks: RefCell::new(BTreeMap::new()),
        }
    }
}

impl<T> Listeners<T> {
    fn connect(&self, f: impl Fn(&T) + 'static) -> ListenerId {
        let id = self.next.get();
        self.next.set(id + 1);
        self.callbacks.borrow_mut().insert(id, Rc::new(f));
        ListenerId(id)
    }

    fn disconnect(&self, id: ListenerId) -> bool {
        self.callbacks.borrow_mut().remove(&id.0).is_some()
    }

    fn notify(&self, value: &T) {
        let callbacks: Vec<_> = self.callbacks.borrow().values().cloned().collect();
        for cb in callbacks {
            cb(value);
        }
    }

    fn len(&self) -> usize {
        self.callbacks.borrow().len()
    }
}

pub struct ControlInlet {
    name: String,
    value: Cell<ControlValue>,
    execution_value: Cell<ControlValue>,
    range: Option<(f32, f32)>,
    listeners: Listeners<ControlValue>,
}

impl ControlInlet {
    pub fn new(name: impl Into<String>, init: ControlValue, range: Option<(f32, f32)>) -> Self {
        Self {
            name: name.into(),
            value: Cell::new(init),
            execution_value: Cell::new(init),
            range,
            listeners: Listeners::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> ControlValue {
        self.value.get()
    }

    /// A user edit. Listeners fire even when the value is unchanged.
    pub fn set_value(&self, value: ControlValue) {
        self.value.set(value);
        self.listeners.notify(&value);
    }

    /// What the node is actually using, as reported back from the audio side.
    pub fn execution_value(&self) -> ControlValue {
        self.execution_value.get()
    }

    pub fn set_execution_value(&self, value: ControlValue) {
        self.execution_value.set(value);
    }

    pub fn range(&self) -> Option<(f32, f32)> {
        self.range
    }

    pub fn on_value_changed(&self, f: impl Fn(&ControlValue) + 'static) -> ListenerId {
        self.listeners.connect(f)
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        self.listeners.disconnect(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

pub struct ControlOutlet {
    name: String,
    value: Cell<ControlValue>,
    listeners: Listeners<ControlValue>,
}

impl ControlOutlet {
    pub fn new(name: impl Into<String>, init: ControlValue) -> Self {
        Self {
            name: name.into(),
            value: Cell::new(init),
            listeners: Listeners::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> ControlValue {
        self.value.get()
    }

    pub fn set_value(&self, value: ControlValue) {
        self.value.set(value);
        self.listeners.notify(&value);
    }

    pub fn on_value_changed(&self, f: impl Fn(&ControlValue) + 'static) -> ListenerId {
        self.listeners.connect(f)
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        self.listeners.disconnect(id)
    }
}

/// A port whose value is a file path (sound, MIDI or raw file).
pub struct ResourceInlet {
    name: String,
    kind: ResourceKind,
    path: RefCell<String>,
    listeners: Listeners<String>,
}

impl ResourceInlet {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            path: RefCell::new(String::new()),
            listeners: Listeners::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn path(&self) -> String {
        self.path.borrow().clone()
    }

    pub fn set_path(&self, path: impl Into<String>) {
        let path = path.into();
        *self.path.borrow_mut() = path.clone();
        self.listeners.notify(&path);
    }

    pub fn on_value_changed(&self, f: impl Fn(&String) + 'static) -> ListenerId {
        self.listeners.connect(f)
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        self.listeners.disconnect(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

pub enum Inlet {
    Audio { name: String, channels: usize },
    Control(Rc<ControlInlet>),
    Resource(Rc<ResourceInlet>),
}

pub enum Outlet {
    Audio { name: String, channels: usize },
    Control(Rc<ControlOutlet>),
}

type UiSink = Box<dyn FnMut(&[u8])>;

/// The document object a bridge is attached to.
pub struct ProcessElement {
    name: String,
    inlets: Vec<Inlet>,
    outlets: Vec<Outlet>,
    to_ui: RefCell<Option<UiSink>>,
}

impl ProcessElement {
    pub fn from_descriptor(descriptor: &NodeDescriptor) -> Rc<Self> {
        let inlets = descriptor.inputs.iter().map(make_inlet).collect();
        let outlets = descriptor.outputs.iter().map(make_outlet).collect();
        Rc::new(Self {
            name: descriptor.name.clone(),
            inlets,
            outlets,
            to_ui: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inlets(&self) -> &[Inlet] {
        &self.inlets
    }

    pub fn outlets(&self) -> &[Outlet] {
        &self.outlets
    }

    /// Control inlets in ordinal order.
    pub fn control_inlets(&self) -> impl Iterator<Item = &Rc<ControlInlet>> {
        self.inlets.iter().filter_map(|i| match i {
            Inlet::Control(c) => Some(c),
            _ => None,
        })
    }

    pub fn control_outlets(&self) -> impl Iterator<Item = &Rc<ControlOutlet>> {
        self.outlets.iter().filter_map(|o| match o {
            Outlet::Control(c) => Some(c),
            _ => None,
        })
    }

    /// Resource inlets with their input field index.
    pub fn resource_inlets(&self) -> impl Iterator<Item = (usize, &Rc<ResourceInlet>)> {
        self.inlets.iter().enumerate().filter_map(|(i, inlet)| match inlet {
            Inlet::Resource(r) => Some((i, r)),
            _ => None,
        })
    }

    pub fn control_inlet(&self, name: &str) -> Option<&Rc<ControlInlet>> {
        self.control_inlets().find(|c| c.name() == name)
    }

    pub fn control_outlet(&self, name: &str) -> Option<&Rc<ControlOutlet>> {
        self.control_outlets().find(|c| c.name() == name)
    }

    pub fn resource_inlet(&self, name: &str) -> Option<&Rc<ResourceInlet>> {
        self.resource_inlets().map(|(_, r)| r).find(|r| r.name() == name)
    }

    /// Where messages from the node's processor go.
    pub fn set_to_ui(&self, sink: impl FnMut(&[u8]) + 'static) {
        *self.to_ui.borrow_mut() = Some(Box::new(sink));
    }

    pub fn reset_to_ui(&self) {
        self.to_ui.borrow_mut().take();
    }

    pub fn has_to_ui(&self) -> bool {
        self.to_ui.borrow().is_some()
    }

    pub(crate) fn deliver_to_ui(&self, message: &[u8]) {
        if let Ok(mut sink) = self.to_ui.try_borrow_mut() {
            if let Some(sink) = sink.as_mut() {
                sink(message);
            }
        }
    }
}

fn make_inlet(port: &PortDescriptor) -> Inlet {
    match &port.kind {
        PortKind::Audio { channels } => Inlet::Audio {
            name: port.name.clone(),
            channels: *channels,
        },
        PortKind::Control { init, range } => Inlet::Control(Rc::new(ControlInlet::new(&port.name, *init, *range))),
        PortKind::Resource(kind) => Inlet::Resource(Rc::new(ResourceInlet::new(&port.name, *kind))),
    }
}

fn make_outlet(port: &PortDescriptor) -> Outlet {
    match &port.kind {
        PortKind::Control { init, .. } => Outlet::Control(Rc::new(ControlOutlet::new(&port.name, *init))),
        PortKind::Audio { channels } => Outlet::Audio {
            name: port.name.clone(),
            channels: *channels,
        },
        // An output resource has no document-side meaning; expose it as silent audio.
        PortKind::Resource(_) => Outlet::Audio {
            name: port.name.clone(),
            channels: 0,
        },
    }
}
