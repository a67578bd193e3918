//! Integration tests for the permission computation flow
//!
//! These follow the same layering the launcher uses: default permissions,
//! then runtime metadata, app metadata, stored overrides and finally
//! CLI-supplied context, each applied via merge.

use appbox::context::{
    BusPolicy, Context, FilesystemMode, SHARE_IPC, SHARE_NETWORK, SOCKET_WAYLAND, SOCKET_X11,
};
use appbox::keyfile::KeyFile;

fn context_of(metadata: &str) -> Context {
    let keyfile = KeyFile::parse(metadata).unwrap();
    Context::parse(&keyfile).unwrap()
}

#[test]
fn test_full_permission_layering() {
    let mut context = Context::with_default_permissions();

    // Runtime grants broad access
    context
        .load_metadata(
            &KeyFile::parse(
                "[Context]\n\
                 shared=network;ipc;\n\
                 sockets=x11;wayland;\n",
            )
            .unwrap(),
        )
        .unwrap();

    // The app narrows it down
    context
        .load_metadata(
            &KeyFile::parse(
                "[Context]\n\
                 shared=!network;\n\
                 sockets=!x11;\n\
                 filesystems=xdg-download;\n\
                 \n\
                 [Session Bus Policy]\n\
                 org.example.A=talk\n",
            )
            .unwrap(),
        )
        .unwrap();

    // User overrides re-grant the network and upgrade the bus policy
    let overrides = Context::load_overrides(
        "[Context]\n\
         shared=network;\n\
         \n\
         [Session Bus Policy]\n\
         org.example.A=own\n",
    )
    .unwrap();
    context.merge(&overrides);

    // Finally an extra CLI context
    let mut cli = Context::new();
    cli.socket("x11").unwrap();
    context.merge(&cli);

    assert!(context.shares.has(SHARE_NETWORK));
    assert!(context.shares.has(SHARE_IPC));
    assert!(context.sockets.has(SOCKET_X11));
    assert!(context.sockets.has(SOCKET_WAYLAND));
    assert_eq!(
        context.filesystems.get("xdg-download"),
        Some(&Some(FilesystemMode::ReadWrite))
    );
    assert_eq!(context.session_bus_policy["org.example.A"], BusPolicy::Own);
    // The portal default survives every layer
    assert_eq!(
        context.session_bus_policy["org.freedesktop.portal.*"],
        BusPolicy::Talk
    );
}

#[test]
fn test_serialized_context_reloads_identically() {
    let mut context = context_of(
        "[Context]\n\
         shared=network;!ipc;\n\
         devices=dri;\n\
         filesystems=~/Work;!~/Work/secrets;host:ro;\n\
         persistent=.local/state/app;\n\
         \n\
         [Environment]\n\
         FROB=1\n\
         \n\
         [Policy Autostart]\n\
         background=yes;!no;\n",
    );
    context.talk_name("org.example.Helper").unwrap();

    let serialized = context.serialize(false).to_string();
    let reloaded = context_of(&serialized);
    assert_eq!(context, reloaded);
}

#[test]
fn test_flattened_context_is_self_contained() {
    let mut context = Context::new();
    context.share("network").unwrap();
    context.unshare("ipc").unwrap();
    context.nofilesystem("~/Private").unwrap();
    context.add_policy("autostart.background=yes").unwrap();
    context.remove_policy("autostart.background=no").unwrap();

    let flat = context.serialize(true).to_string();

    // Negations never appear in flattened output
    assert!(!flat.contains('!'));
    assert!(!flat.contains("~/Private"));

    // And reloading grants exactly the same things
    let reloaded = context_of(&flat);
    assert!(reloaded.shares.has(SHARE_NETWORK));
    assert!(!reloaded.shares.has(SHARE_IPC));
    assert_eq!(
        reloaded.generic_policy.get("autostart.background"),
        Some(&vec!["yes".to_string()])
    );
}
