//! Core classes every runtime starts with
//!
//! `java/lang/Object`, `java/lang/String` and the `Throwable` hierarchy used
//! by the exception constructors. Their few methods are natives.

use std::sync::Arc;

use crate::vm::class::{ClassDef, ClassFlags, ClassRegistry, LinkError, OBJECT_CLASS, STRING_CLASS};
use crate::vm::method::{MethodDef, MethodFlags};
use crate::vm::native::{native_fn, receiver};
use crate::vm::value::Value;
use crate::vm::VmError;

/// Root of the exception hierarchy
pub const THROWABLE_CLASS: &str = "java/lang/Throwable";

/// `(superclass, class)` pairs of the standard hierarchy, parents first
pub const THROWABLE_HIERARCHY: &[(&str, &str)] = &[
    (THROWABLE_CLASS, "java/lang/Exception"),
    (THROWABLE_CLASS, "java/lang/Error"),
    ("java/lang/Exception", "java/lang/RuntimeException"),
    ("java/lang/RuntimeException", "java/lang/NullPointerException"),
    ("java/lang/RuntimeException", "java/lang/ArithmeticException"),
    ("java/lang/RuntimeException", "java/lang/ArrayStoreException"),
    ("java/lang/RuntimeException", "java/lang/NegativeArraySizeException"),
    ("java/lang/RuntimeException", "java/lang/ClassCastException"),
    ("java/lang/RuntimeException", "java/lang/IllegalMonitorStateException"),
    ("java/lang/RuntimeException", "java/lang/IndexOutOfBoundsException"),
    ("java/lang/IndexOutOfBoundsException", "java/lang/ArrayIndexOutOfBoundsException"),
    ("java/lang/Error", "java/lang/VirtualMachineError"),
    ("java/lang/VirtualMachineError", "java/lang/OutOfMemoryError"),
    ("java/lang/VirtualMachineError", "java/lang/StackOverflowError"),
    ("java/lang/Error", "java/lang/LinkageError"),
    ("java/lang/LinkageError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/IncompatibleClassChangeError", "java/lang/NoSuchMethodError"),
    ("java/lang/IncompatibleClassChangeError", "java/lang/NoSuchFieldError"),
    ("java/lang/LinkageError", "java/lang/NoClassDefFoundError"),
];

/// Define the core classes in an empty registry. Classes that already exist
/// are left alone, so calling this twice is harmless.
pub fn define_core_classes(registry: &Arc<ClassRegistry>) -> Result<(), LinkError> {
    if registry.lookup(OBJECT_CLASS).is_none() {
        let mut object = ClassDef::new(OBJECT_CLASS)
            .method(MethodDef::native("<init>", "()V", MethodFlags::PUBLIC, native_fn(|_, _| Ok(None))))
            .method(MethodDef::native(
                "hashCode",
                "()I",
                MethodFlags::PUBLIC,
                native_fn(|_, args| Ok(Some(Value::Int(receiver(args)?.identity_hash())))),
            ));
        object.superclass = None;
        registry.define(object)?;
    }

    if registry.lookup(STRING_CLASS).is_none() {
        registry.define(
            ClassDef::new(STRING_CLASS)
                .flags(ClassFlags::PUBLIC | ClassFlags::FINAL)
                .method(MethodDef::native(
                    "length",
                    "()I",
                    MethodFlags::PUBLIC,
                    native_fn(|_, args| {
                        let this = receiver(args)?;
                        let len = this
                            .as_str()
                            .ok_or_else(|| VmError::TypeMismatch(format!("{} is not a string", this.class_name())))?
                            .chars()
                            .count();
                        Ok(Some(Value::Int(len as i32)))
                    }),
                )),
        )?;
    }

    if registry.lookup(THROWABLE_CLASS).is_none() {
        registry.define(
            ClassDef::new(THROWABLE_CLASS)
                .field("message", "Ljava/lang/String;")
                .method(MethodDef::native("<init>", "()V", MethodFlags::PUBLIC, native_fn(|_, _| Ok(None))))
                .method(MethodDef::native(
                    "<init>",
                    "(Ljava/lang/String;)V",
                    MethodFlags::PUBLIC,
                    native_fn(|_, args| {
                        let message = args.get(1).cloned().unwrap_or_default();
                        receiver(args)?.set_field(0, message)?;
                        Ok(None)
                    }),
                ))
                .method(MethodDef::native(
                    "getMessage",
                    "()Ljava/lang/String;",
                    MethodFlags::PUBLIC,
                    native_fn(|_, args| Ok(Some(receiver(args)?.field(0)?))),
                )),
        )?;
    }

    for (superclass, name) in THROWABLE_HIERARCHY {
        if registry.lookup(name).is_none() {
            registry.define(ClassDef::new(name).extends(superclass))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_classes_link() {
        let registry = ClassRegistry::new();
        define_core_classes(&registry).unwrap();
        let npe = registry.lookup("java/lang/NullPointerException").unwrap();
        let throwable = registry.lookup(THROWABLE_CLASS).unwrap();
        assert!(npe.is_assignable_to(&throwable));
        assert_eq!(npe.find_field("message", "Ljava/lang/String;").unwrap().slot, 0);
        assert!(npe.find_method("<init>", "(Ljava/lang/String;)V").is_some());
        assert!(npe.find_virtual("getMessage", "()Ljava/lang/String;").is_some());

        let count = registry.len();
        define_core_classes(&registry).unwrap();
        assert_eq!(registry.len(), count);
    }

    #[test]
    fn test_errors_are_not_exceptions() {
        let registry = ClassRegistry::new();
        define_core_classes(&registry).unwrap();
        let oom = registry.lookup("java/lang/OutOfMemoryError").unwrap();
        let exception = registry.lookup("java/lang/Exception").unwrap();
        let error = registry.lookup("java/lang/Error").unwrap();
        assert!(!oom.is_assignable_to(&exception));
        assert!(oom.is_assignable_to(&error));
    }
}
