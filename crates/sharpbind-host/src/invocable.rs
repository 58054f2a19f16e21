//! Managed → native call targets.
//!
//! Arguments are passed in frame-slot order: the receiver handle first for
//! instance functions, then each parameter. Out and in-out arguments are
//! overwritten with the values the native side produced.

use crate::error::HostError;
use crate::marshal::Frame;
use crate::reflection::NativeReflection;
use crate::value::Value;
use sharpbind_core::FunctionId;
use sharpbind_core::codegen::native::{STATUS_OK, TrampolineEntry};
use sharpbind_core::layout::FrameLayout;
use sharpbind_core::model::ParamDirection;
use std::sync::Arc;

/// `int32 SYMBOL(uint8* Args, int32 ArgCount, uint8* Ret)`
pub type TrampolineFn = unsafe extern "C" fn(*mut u8, i32, *mut u8) -> i32;

pub trait Invocable: Send + Sync {
    fn id(&self) -> &FunctionId;
    fn is_direct(&self) -> bool;
    fn invoke(&self, args: &mut [Value]) -> Result<Value, HostError>;
}

/// Calls a generated trampoline over a packed frame.
#[derive(Debug)]
pub struct DirectInvocable {
    id: FunctionId,
    symbol: String,
    entry: TrampolineFn,
    layout: FrameLayout,
}

impl DirectInvocable {
    pub fn new(entry: &TrampolineEntry, function: TrampolineFn) -> Self {
        Self {
            id: entry.id.clone(),
            symbol: entry.symbol.clone(),
            entry: function,
            layout: entry.layout.clone(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    fn pack(&self, args: &[Value]) -> Result<Frame, HostError> {
        let mut frame = Frame::new(self.layout.size);
        for (slot, value) in self.layout.slots.iter().zip(args) {
            if slot.direction != ParamDirection::Out {
                frame
                    .write(slot.offset, &slot.repr, value)
                    .map_err(|e| HostError::marshal(format!("{}.{}: {e}", self.id, slot.name)))?;
            }
        }
        Ok(frame)
    }
}

impl Invocable for DirectInvocable {
    fn id(&self) -> &FunctionId {
        &self.id
    }

    fn is_direct(&self) -> bool {
        true
    }

    fn invoke(&self, args: &mut [Value]) -> Result<Value, HostError> {
        let count = self.layout.arg_count();
        if args.len() != count {
            return Err(HostError::marshal(format!(
                "{} expects {count} arguments, got {}",
                self.id,
                args.len()
            )));
        }
        let mut frame = self.pack(args)?;
        let mut ret = Frame::new(self.layout.return_size());

        // SAFETY: the frame is sized and aligned per the layout the trampoline
        // was generated from, and the return buffer holds the return value.
        let status = unsafe { (self.entry)(frame.as_mut_ptr(), count as i32, ret.as_mut_ptr()) };
        if status != STATUS_OK {
            return Err(HostError::NativeCallFailed {
                function: self.id.to_string(),
                status,
            });
        }

        for (slot, value) in self.layout.slots.iter().zip(args.iter_mut()) {
            if slot.direction.writes_back() {
                *value = frame.read(slot.offset, &slot.repr)?;
            }
        }
        match &self.layout.ret {
            Some(repr) => ret.read(0, repr),
            None => Ok(Value::Void),
        }
    }
}

/// Resolves the function by name through native reflection on every call.
pub struct LookupInvocable {
    id: FunctionId,
    reflection: Arc<dyn NativeReflection>,
}

impl LookupInvocable {
    pub fn new(id: FunctionId, reflection: Arc<dyn NativeReflection>) -> Self {
        Self { id, reflection }
    }
}

impl Invocable for LookupInvocable {
    fn id(&self) -> &FunctionId {
        &self.id
    }

    fn is_direct(&self) -> bool {
        false
    }

    fn invoke(&self, args: &mut [Value]) -> Result<Value, HostError> {
        self.reflection.call(&self.id, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharpbind_core::codegen::native::STATUS_NULL_SELF;
    use sharpbind_core::layout::{FrameSlot, NativeCategory, NativeRepr};

    fn repr(category: NativeCategory, size: usize, native_type: &str) -> NativeRepr {
        NativeRepr {
            category,
            size,
            align: size,
            native_type: native_type.into(),
        }
    }

    // Actor.Scale(self, float Factor, out int32 Steps) -> float
    fn scale_entry() -> TrampolineEntry {
        let float = repr(NativeCategory::Float, 4, "float");
        TrampolineEntry {
            id: FunctionId::new("Actor", "Scale"),
            symbol: "SBFI_5Actor_5Scale".into(),
            layout: FrameLayout {
                receiver: true,
                slots: vec![
                    FrameSlot {
                        name: "self".into(),
                        offset: 0,
                        direction: ParamDirection::In,
                        repr: repr(NativeCategory::ObjectHandle, 8, "UActor*"),
                    },
                    FrameSlot {
                        name: "Factor".into(),
                        offset: 8,
                        direction: ParamDirection::In,
                        repr: float.clone(),
                    },
                    FrameSlot {
                        name: "Steps".into(),
                        offset: 12,
                        direction: ParamDirection::Out,
                        repr: repr(NativeCategory::Integer { signed: true }, 4, "int32"),
                    },
                ],
                size: 16,
                align: 8,
                ret: Some(float),
            },
        }
    }

    unsafe extern "C" fn scale(args: *mut u8, argc: i32, ret: *mut u8) -> i32 {
        if argc != 3 {
            return 1;
        }
        unsafe {
            if (args as *const usize).read() == 0 {
                return STATUS_NULL_SELF;
            }
            let factor = (args.add(8) as *const f32).read();
            (args.add(12) as *mut i32).write(3);
            (ret as *mut f32).write(factor * 2.0);
        }
        STATUS_OK
    }

    #[test]
    fn test_direct_call_writes_back() {
        let invocable = DirectInvocable::new(&scale_entry(), scale);
        let mut args = vec![Value::Handle(0x1000), Value::F32(1.25), Value::Void];
        let result = invocable.invoke(&mut args).unwrap();
        assert_eq!(result, Value::F32(2.5));
        assert_eq!(args[2], Value::I32(3));
        assert!(invocable.is_direct());
    }

    #[test]
    fn test_direct_call_status_is_reported() {
        let invocable = DirectInvocable::new(&scale_entry(), scale);
        let mut args = vec![Value::Handle(0), Value::F32(1.0), Value::Void];
        assert_eq!(
            invocable.invoke(&mut args),
            Err(HostError::NativeCallFailed {
                function: "Actor.Scale".into(),
                status: STATUS_NULL_SELF,
            })
        );
    }

    #[test]
    fn test_direct_call_checks_arity() {
        let invocable = DirectInvocable::new(&scale_entry(), scale);
        let mut args = vec![Value::Handle(1)];
        assert!(matches!(invocable.invoke(&mut args), Err(HostError::Marshal(_))));
    }
}
