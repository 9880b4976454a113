use pretty_assertions::assert_eq;

use crate::{
    error::MarshalError,
    tests::test_helpers::with_vm,
    value::GuestValue,
};

fn sample_values() -> Vec<GuestValue> {
    vec![
        GuestValue::Undefined,
        GuestValue::Null,
        GuestValue::Bool(true),
        GuestValue::Bool(false),
        GuestValue::Number(0.0),
        GuestValue::Number(-1.5),
        GuestValue::Number(1e100),
        GuestValue::String(String::new()),
        GuestValue::String("hello, world".to_string()),
        GuestValue::String("snowman \u{2603}".to_string()),
        GuestValue::Array(vec![
            GuestValue::Number(1.0),
            GuestValue::String("two".to_string()),
            GuestValue::Array(vec![GuestValue::Null]),
        ]),
        GuestValue::Object(vec![
            ("b".to_string(), GuestValue::Number(2.0)),
            ("a".to_string(), GuestValue::Number(1.0)),
            (
                "nested".to_string(),
                GuestValue::Object(vec![("x".to_string(), GuestValue::Bool(true))]),
            ),
        ]),
    ]
}

#[test]
fn test_marshal_round_trip() -> anyhow::Result<()> {
    with_vm(|vm| {
        for value in sample_values() {
            let handle = vm.to_guest(&value)?;
            let back = vm.dump(&handle)?;
            assert_eq!(back, value);
        }
        Ok(())
    })
}

#[test]
fn test_object_key_order_is_preserved() -> anyhow::Result<()> {
    with_vm(|vm| {
        let value = GuestValue::Object(vec![
            ("zebra".to_string(), GuestValue::Number(1.0)),
            ("apple".to_string(), GuestValue::Number(2.0)),
            ("mango".to_string(), GuestValue::Number(3.0)),
        ]);
        let handle = vm.to_guest(&value)?;
        let back = vm.dump(&handle)?;
        assert_eq!(back, value);
        Ok(())
    })
}

#[test]
fn test_marshal_opaque_fails() -> anyhow::Result<()> {
    with_vm(|vm| {
        let err = vm
            .to_guest(&GuestValue::Opaque("function"))
            .expect_err("opaque values must not marshal");
        assert!(err.downcast_ref::<MarshalError>().is_some(), "{err:?}");
        Ok(())
    })
}

#[test]
fn test_dump_function_is_opaque() -> anyhow::Result<()> {
    with_vm(|vm| {
        let function = vm
            .eval_script("(function f() { return 1; })")?
            .expect("function literal must evaluate");
        assert_eq!(vm.dump(&function)?, GuestValue::Opaque("function"));
        assert_eq!(vm.type_of(&function)?, "function");
        Ok(())
    })
}

#[test]
fn test_dump_error_value() -> anyhow::Result<()> {
    with_vm(|vm| {
        let error = vm
            .eval_script("new TypeError('bad input')")?
            .expect("error literal must evaluate");
        let dumped = vm.dump(&error)?;
        let GuestValue::Error(e) = dumped else {
            panic!("expected an error dump, got {dumped:?}");
        };
        assert_eq!(e.name, "TypeError");
        assert_eq!(e.message, "bad input");
        Ok(())
    })
}

#[test]
fn test_type_of() -> anyhow::Result<()> {
    with_vm(|vm| {
        let cases = [
            ("undefined", "undefined"),
            ("null", "null"),
            ("true", "boolean"),
            ("1.5", "number"),
            ("'s'", "string"),
            ("({})", "object"),
            ("[]", "object"),
        ];
        for (source, expected) in cases {
            let handle = vm
                .eval_script(&format!("({source})"))?
                .expect("literal must evaluate");
            assert_eq!(vm.type_of(&handle)?, expected, "typeof {source}");
        }
        Ok(())
    })
}

#[test]
fn test_property_ops() -> anyhow::Result<()> {
    with_vm(|vm| {
        let object = vm.new_object();
        let value = vm.new_number(7.0);
        vm.set_prop(&object, "x", &value)?;
        let read = vm.get_prop(&object, "x")?;
        assert_eq!(vm.dump(&read)?, GuestValue::Number(7.0));

        let missing = vm.get_prop(&object, "y")?;
        assert_eq!(vm.dump(&missing)?, GuestValue::Undefined);

        let array = vm.new_array();
        vm.set_index(&array, 0, &value)?;
        let read = vm.get_index(&array, 0)?;
        assert_eq!(vm.dump(&read)?, GuestValue::Number(7.0));

        // Property access on a non-object receiver is an error.
        let number = vm.new_number(1.0);
        assert!(vm.get_prop(&number, "x").is_err());
        Ok(())
    })
}

#[test]
fn test_handle_dup_and_dispose() -> anyhow::Result<()> {
    with_vm(|vm| {
        let mut handle = vm.new_number(3.0);
        let dup = handle.dup();
        handle.dispose();
        assert!(!handle.is_alive());
        // The duplicate is an independent owner.
        assert!(dup.is_alive());
        assert_eq!(vm.dump(&dup)?, GuestValue::Number(3.0));
        // Using a disposed handle is an error, not a crash.
        assert!(vm.dump(&handle).is_err());
        Ok(())
    })
}

#[test]
fn test_script_mode_eval() -> anyhow::Result<()> {
    with_vm(|vm| {
        let result = vm
            .eval_script("1 + 2")?
            .expect("script must evaluate");
        assert_eq!(vm.dump(&result)?, GuestValue::Number(3.0));

        let err = vm
            .eval_script("const x=;")?
            .expect_err("syntax error must be reported in-band");
        assert_eq!(err.name, "SyntaxError");
        Ok(())
    })
}

#[test]
fn test_call_function() -> anyhow::Result<()> {
    with_vm(|vm| {
        let function = vm
            .eval_script("(function(a, b) { return a * b; })")?
            .expect("function literal must evaluate");
        let a = vm.new_number(6.0);
        let b = vm.new_number(7.0);
        let result = vm
            .call_function(&function, None, &[a, b])?
            .expect("multiplication must not throw");
        assert_eq!(vm.dump(&result)?, GuestValue::Number(42.0));

        let throwing = vm
            .eval_script("(function() { throw new Error('from guest'); })")?
            .expect("function literal must evaluate");
        let err = vm
            .call_function(&throwing, None, &[])?
            .expect_err("guest throw must be reported in-band");
        assert_eq!(err.message, "from guest");
        Ok(())
    })
}
