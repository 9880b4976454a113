use anyhow::anyhow;
use url::Url;

use crate::{
    context_state::RawFnCallback,
    entered_context::EnteredVm,
    error::GuestError,
    handle::Handle,
    module::{
        CageModule,
        HostSlots,
        ModuleContext,
    },
    value::GuestValue,
};

/// Installs `URL` and `URLSearchParams` over the `url` crate.
///
/// Instances carry their parsed state in host slots; component properties
/// are materialized at construction time. `searchParams` is a snapshot of
/// the query at construction; mutating it does not rewrite `href`.
pub struct UrlModule;

type ParamsState = Vec<(String, String)>;

fn string_arg(vm: &mut EnteredVm<'_, '_>, args: &[Handle], index: usize) -> anyhow::Result<Option<String>> {
    let Some(arg) = args.get(index) else {
        return Ok(None);
    };
    let dumped = vm.dump(arg)?;
    Ok(match dumped {
        GuestValue::Undefined | GuestValue::Null => None,
        GuestValue::String(s) => Some(s),
        // `new URL(..., base)` accepts another URL object; take its href.
        GuestValue::Object(_) => dumped
            .get("href")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        other => Some(other.to_string()),
    })
}

fn parse_url(href: &str, base: Option<&str>) -> anyhow::Result<Url> {
    let parsed = match base {
        Some(base) => {
            let base = Url::parse(base)
                .map_err(|e| anyhow!(GuestError::type_error(format!("Invalid base URL: {e}"))))?;
            base.join(href)
        },
        None => Url::parse(href),
    };
    parsed.map_err(|e| anyhow!(GuestError::type_error(format!("Invalid URL: {e}"))))
}

fn set_string_prop(
    vm: &mut EnteredVm<'_, '_>,
    object: &Handle,
    key: &str,
    value: &str,
) -> anyhow::Result<()> {
    let value = vm.new_string(value)?;
    vm.set_prop(object, key, &value)
}

fn install_url_props(vm: &mut EnteredVm<'_, '_>, this: &Handle, url: &Url) -> anyhow::Result<()> {
    set_string_prop(vm, this, "href", url.as_str())?;
    set_string_prop(vm, this, "protocol", &format!("{}:", url.scheme()))?;
    set_string_prop(vm, this, "hostname", url.host_str().unwrap_or(""))?;
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };
    set_string_prop(vm, this, "host", &host)?;
    set_string_prop(
        vm,
        this,
        "port",
        &url.port().map(|p| p.to_string()).unwrap_or_default(),
    )?;
    set_string_prop(vm, this, "pathname", url.path())?;
    set_string_prop(
        vm,
        this,
        "search",
        &url.query().map(|q| format!("?{q}")).unwrap_or_default(),
    )?;
    set_string_prop(
        vm,
        this,
        "hash",
        &url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
    )?;
    set_string_prop(vm, this, "origin", &url.origin().ascii_serialization())?;
    set_string_prop(vm, this, "username", url.username())?;
    set_string_prop(vm, this, "password", url.password().unwrap_or(""))?;
    Ok(())
}

fn serialize_params(params: &ParamsState) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}

fn params_from_init(init: &GuestValue) -> anyhow::Result<ParamsState> {
    match init {
        GuestValue::Undefined | GuestValue::Null => Ok(Vec::new()),
        GuestValue::String(s) => {
            let trimmed = s.strip_prefix('?').unwrap_or(s);
            Ok(url::form_urlencoded::parse(trimmed.as_bytes())
                .into_owned()
                .collect())
        },
        GuestValue::Object(entries) => Ok(entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()),
        GuestValue::Array(items) => {
            let mut params = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    GuestValue::Array(pair) if pair.len() == 2 => {
                        params.push((pair[0].to_string(), pair[1].to_string()));
                    },
                    _ => {
                        return Err(anyhow!(GuestError::type_error(
                            "URLSearchParams init array must contain [name, value] pairs"
                        )));
                    },
                }
            }
            Ok(params)
        },
        _ => Err(anyhow!(GuestError::type_error(
            "unsupported URLSearchParams init"
        ))),
    }
}

struct ParamMethods {
    get: Handle,
    get_all: Handle,
    has: Handle,
    append: Handle,
    set: Handle,
    delete: Handle,
    to_string: Handle,
}

fn name_arg(vm: &mut EnteredVm<'_, '_>, args: &[Handle]) -> anyhow::Result<String> {
    args.first()
        .map(|a| vm.dump(a))
        .transpose()?
        .map(|v| v.to_string())
        .ok_or_else(|| anyhow!(GuestError::type_error("missing parameter name")))
}

fn define_param_methods(
    ctx: &mut ModuleContext<'_, '_, '_>,
    slots: &HostSlots<ParamsState>,
) -> anyhow::Result<ParamMethods> {
    let st = slots.clone();
    let get: RawFnCallback = Box::new(move |vm, this, args| {
        let name = name_arg(vm, args)?;
        let value =
            st.with_instance(vm, &this, |params| {
                params.iter().find(|(k, _)| *k == name).map(|(_, v)| v.clone())
            })?;
        match value {
            Some(v) => vm.new_string(&v),
            None => Ok(vm.null()),
        }
    });
    let st = slots.clone();
    let get_all: RawFnCallback = Box::new(move |vm, this, args| {
        let name = name_arg(vm, args)?;
        let values = st.with_instance(vm, &this, |params| {
            params
                .iter()
                .filter(|(k, _)| *k == name)
                .map(|(_, v)| GuestValue::String(v.clone()))
                .collect::<Vec<_>>()
        })?;
        vm.to_guest(&GuestValue::Array(values))
    });
    let st = slots.clone();
    let has: RawFnCallback = Box::new(move |vm, this, args| {
        let name = name_arg(vm, args)?;
        let found = st.with_instance(vm, &this, |params| {
            params.iter().any(|(k, _)| *k == name)
        })?;
        Ok(vm.boolean(found))
    });
    let st = slots.clone();
    let append: RawFnCallback = Box::new(move |vm, this, args| {
        let name = name_arg(vm, args)?;
        let value = args
            .get(1)
            .map(|a| vm.dump(a))
            .transpose()?
            .map(|v| v.to_string())
            .unwrap_or_default();
        st.with_instance(vm, &this, |params| params.push((name, value)))?;
        Ok(vm.undefined())
    });
    let st = slots.clone();
    let set: RawFnCallback = Box::new(move |vm, this, args| {
        let name = name_arg(vm, args)?;
        let value = args
            .get(1)
            .map(|a| vm.dump(a))
            .transpose()?
            .map(|v| v.to_string())
            .unwrap_or_default();
        st.with_instance(vm, &this, |params| {
            params.retain(|(k, _)| *k != name);
            params.push((name, value));
        })?;
        Ok(vm.undefined())
    });
    let st = slots.clone();
    let delete: RawFnCallback = Box::new(move |vm, this, args| {
        let name = name_arg(vm, args)?;
        st.with_instance(vm, &this, |params| params.retain(|(k, _)| *k != name))?;
        Ok(vm.undefined())
    });
    let st = slots.clone();
    let to_string: RawFnCallback = Box::new(move |vm, this, _args| {
        let serialized = st.with_instance(vm, &this, |params| serialize_params(params))?;
        vm.new_string(&serialized)
    });

    Ok(ParamMethods {
        get: ctx.sandbox_fn_raw("get", get)?,
        get_all: ctx.sandbox_fn_raw("getAll", get_all)?,
        has: ctx.sandbox_fn_raw("has", has)?,
        append: ctx.sandbox_fn_raw("append", append)?,
        set: ctx.sandbox_fn_raw("set", set)?,
        delete: ctx.sandbox_fn_raw("delete", delete)?,
        to_string: ctx.sandbox_fn_raw("toString", to_string)?,
    })
}

fn build_params_object(
    vm: &mut EnteredVm<'_, '_>,
    slots: &HostSlots<ParamsState>,
    methods: &ParamMethods,
    params: ParamsState,
    this: Option<&Handle>,
) -> anyhow::Result<Handle> {
    let object = match this {
        Some(h) => h.dup(),
        None => {
            let object = vm.new_object();
            vm.manage(object)?
        },
    };
    slots.attach(vm, &object, params)?;
    vm.set_prop(&object, "get", &methods.get)?;
    vm.set_prop(&object, "getAll", &methods.get_all)?;
    vm.set_prop(&object, "has", &methods.has)?;
    vm.set_prop(&object, "append", &methods.append)?;
    vm.set_prop(&object, "set", &methods.set)?;
    vm.set_prop(&object, "delete", &methods.delete)?;
    vm.set_prop(&object, "toString", &methods.to_string)?;
    Ok(object)
}

impl CageModule for UrlModule {
    fn def(&self, ctx: &mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()> {
        let url_slots: HostSlots<Url> = HostSlots::new();
        let param_slots: HostSlots<ParamsState> = HostSlots::new();

        let param_methods = std::rc::Rc::new(define_param_methods(ctx, &param_slots)?);

        let st = url_slots.clone();
        let to_string: RawFnCallback = Box::new(move |vm, this, _args| {
            let href = st.with_instance(vm, &this, |url| url.to_string())?;
            vm.new_string(&href)
        });
        let url_to_string = ctx.sandbox_fn_raw("toString", to_string)?;
        let url_to_json = url_to_string.dup();

        let st = url_slots.clone();
        let ps = param_slots.clone();
        let pm = param_methods.clone();
        let url_ctor: RawFnCallback = Box::new(move |vm, this, args| {
            let href = string_arg(vm, args, 0)?
                .ok_or_else(|| anyhow!(GuestError::type_error("URL requires an href argument")))?;
            let base = string_arg(vm, args, 1)?;
            let url = parse_url(&href, base.as_deref())?;

            install_url_props(vm, &this, &url)?;
            vm.set_prop(&this, "toString", &url_to_string)?;
            vm.set_prop(&this, "toJSON", &url_to_json)?;

            let params: ParamsState = url.query_pairs().into_owned().collect();
            let search_params = build_params_object(vm, &ps, &pm, params, None)?;
            vm.set_prop(&this, "searchParams", &search_params)?;

            st.attach(vm, &this, url)?;
            Ok(vm.undefined())
        });
        ctx.define_sandbox_fn_raw("URL", url_ctor)?;

        let ps = param_slots;
        let pm = param_methods;
        let params_ctor: RawFnCallback = Box::new(move |vm, this, args| {
            let init = match args.first() {
                Some(arg) => vm.dump(arg)?,
                None => GuestValue::Undefined,
            };
            let params = params_from_init(&init)?;
            build_params_object(vm, &ps, &pm, params, Some(&this))?;
            Ok(vm.undefined())
        });
        ctx.define_sandbox_fn_raw("URLSearchParams", params_ctor)?;

        Ok(())
    }
}
