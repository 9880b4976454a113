//! The standard capability modules. Each installs one slice of a web-ish
//! runtime surface into the guest; none is required, and hosts can supply
//! their own [`CageModule`](crate::CageModule)s alongside or instead of
//! these.

mod blob;
mod console;
mod crypto;
mod encoding;
mod esm;
mod fetch;
mod timers;
mod url;

pub use self::{
    blob::BlobModule,
    console::{
        ConsoleModule,
        ConsoleSink,
        LogCapture,
        LogLevel,
    },
    crypto::CryptoModule,
    encoding::EncodingModule,
    esm::{
        EsmModule,
        HttpModuleLoader,
    },
    fetch::FetchModule,
    timers::TimersModule,
    url::UrlModule,
};
