use std::rc::Rc;

use anyhow::anyhow;
use bytes::Bytes;
use futures::FutureExt;

use crate::{
    context_state::{
        GuestReentry,
        RawFnCallback,
    },
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

/// Installs `fetch`. Requests run on the host's HTTP client while the guest
/// sits in the pump loop; the returned promise settles when the full
/// response body has arrived.
///
/// The response object carries `status`, `ok`, `statusText`, `url`, a plain
/// `headers` mapping, and the async accessors `text()`, `json()`, and
/// `arrayBuffer()`.
pub struct FetchModule;

struct ResponseState {
    body: Bytes,
}

struct FetchedResponse {
    status: u16,
    status_text: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

struct RequestInit {
    method: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

fn parse_init(init: Option<GuestValue>) -> anyhow::Result<RequestInit> {
    let mut parsed = RequestInit {
        method: "GET".to_string(),
        headers: Vec::new(),
        body: None,
    };
    let Some(init) = init else {
        return Ok(parsed);
    };
    match init {
        GuestValue::Undefined | GuestValue::Null => return Ok(parsed),
        GuestValue::Object(_) => (),
        _ => {
            return Err(anyhow!(GuestError::type_error(
                "fetch init must be an object"
            )));
        },
    }
    if let Some(method) = init.get("method").and_then(|v| v.as_str()) {
        parsed.method = method.to_uppercase();
    }
    if let Some(GuestValue::Object(headers)) = init.get("headers") {
        parsed.headers = headers
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
    }
    match init.get("body") {
        None | Some(GuestValue::Undefined) | Some(GuestValue::Null) => (),
        Some(GuestValue::String(body)) => parsed.body = Some(body.clone()),
        Some(other) => parsed.body = Some(other.to_string()),
    }
    Ok(parsed)
}

async fn perform_fetch(
    client: reqwest::Client,
    url: String,
    init: RequestInit,
) -> anyhow::Result<FetchedResponse> {
    let method = reqwest::Method::from_bytes(init.method.as_bytes())
        .map_err(|e| anyhow!(GuestError::type_error(format!("Invalid method: {e}"))))?;
    let mut request = client.request(method, &url);
    for (name, value) in init.headers {
        request = request.header(name, value);
    }
    if let Some(body) = init.body {
        request = request.body(body);
    }
    let response = request
        .send()
        .await
        .map_err(|e| anyhow!(GuestError::type_error(format!("Failed to fetch: {e}"))))?;

    let status = response.status();
    let url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|e| anyhow!(GuestError::type_error(format!("Failed to read body: {e}"))))?;
    Ok(FetchedResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
        url,
        headers,
        body,
    })
}

struct ResponseMethods {
    text: Handle,
    json: Handle,
    array_buffer: Handle,
}

fn build_response_object(
    vm: &mut EnteredVm<'_, '_>,
    slots: &HostSlots<ResponseState>,
    methods: &ResponseMethods,
    response: FetchedResponse,
) -> anyhow::Result<Handle> {
    let object = vm.new_object();
    let object = vm.manage(object)?;

    let status = vm.new_number(response.status as f64);
    vm.set_prop(&object, "status", &status)?;
    let ok = vm.boolean((200..300).contains(&response.status));
    vm.set_prop(&object, "ok", &ok)?;
    let status_text = vm.new_string(&response.status_text)?;
    vm.set_prop(&object, "statusText", &status_text)?;
    let url = vm.new_string(&response.url)?;
    vm.set_prop(&object, "url", &url)?;

    let headers = GuestValue::Object(
        response
            .headers
            .into_iter()
            .map(|(k, v)| (k, GuestValue::String(v)))
            .collect(),
    );
    let headers = vm.to_guest(&headers)?;
    vm.set_prop(&object, "headers", &headers)?;

    vm.set_prop(&object, "text", &methods.text)?;
    vm.set_prop(&object, "json", &methods.json)?;
    vm.set_prop(&object, "arrayBuffer", &methods.array_buffer)?;
    slots.attach(vm, &object, ResponseState {
        body: response.body,
    })?;
    Ok(object)
}

impl CageModule for FetchModule {
    fn def(&self, ctx: &mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let slots: HostSlots<ResponseState> = HostSlots::new();

        let st = slots.clone();
        let text: RawFnCallback = Box::new(move |vm, this, _args| {
            let body = st.with_instance(vm, &this, |state| state.body.clone())?;
            let (promise, promise_id) = vm.new_promise()?;
            let text = String::from_utf8_lossy(&body).to_string();
            let text = vm.new_string(&text)?;
            vm.settle_promise(promise_id, Ok(text))?;
            Ok(promise)
        });
        let st = slots.clone();
        let json: RawFnCallback = Box::new(move |vm, this, _args| {
            let body = st.with_instance(vm, &this, |state| state.body.clone())?;
            let (promise, promise_id) = vm.new_promise()?;
            let settled = match serde_json::from_slice::<serde_json::Value>(&body) {
                Ok(value) => Ok(vm.to_guest(&GuestValue::from(value))?),
                Err(e) => Err(GuestError::new(
                    "SyntaxError",
                    format!("Failed to parse JSON: {e}"),
                )),
            };
            vm.settle_promise(promise_id, settled)?;
            Ok(promise)
        });
        let st = slots.clone();
        let array_buffer: RawFnCallback = Box::new(move |vm, this, _args| {
            let body = st.with_instance(vm, &this, |state| state.body.to_vec())?;
            let (promise, promise_id) = vm.new_promise()?;
            let buffer = vm.new_array_buffer(body);
            vm.settle_promise(promise_id, Ok(buffer))?;
            Ok(promise)
        });

        let methods = Rc::new(ResponseMethods {
            text: ctx.sandbox_fn_raw("text", text)?,
            json: ctx.sandbox_fn_raw("json", json)?,
            array_buffer: ctx.sandbox_fn_raw("arrayBuffer", array_buffer)?,
        });

        let fetch: RawFnCallback = Box::new(move |vm, _this, args| {
            let url = args
                .first()
                .map(|a| vm.dump(a))
                .transpose()?
                .map(|v| match v {
                    GuestValue::String(s) => s,
                    // `fetch(new URL(...))` takes the href.
                    other => other
                        .get("href")
                        .and_then(|h| h.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| other.to_string()),
                })
                .ok_or_else(|| anyhow!(GuestError::type_error("fetch requires a URL")))?;
            let init = args.get(1).map(|a| vm.dump(a)).transpose()?;
            let init = parse_init(init)?;

            let (promise, promise_id) = vm.new_promise()?;
            let client = client.clone();
            let slots = slots.clone();
            let methods = methods.clone();
            let task = perform_fetch(client, url, init)
                .map(move |result| {
                    let reentry: GuestReentry = Box::new(move |vm: &mut EnteredVm<'_, '_>| {
                        let settled = match result {
                            Ok(response) => {
                                match build_response_object(vm, &slots, &methods, response) {
                                    Ok(object) => Ok(object),
                                    Err(e) => {
                                        Err(crate::error::guest_error_from_host_failure(&e))
                                    },
                                }
                            },
                            Err(e) => Err(crate::error::guest_error_from_host_failure(&e)),
                        };
                        vm.settle_promise(promise_id, settled)
                    });
                    Some(reentry)
                })
                .boxed_local();
            vm.push_host_task(task)?;
            Ok(promise)
        });
        ctx.define_sandbox_fn_raw("fetch", fetch)?;

        Ok(())
    }
}
