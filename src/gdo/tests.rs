use super::*;

use crate::internal;

use rand::Rng;

//-----------------------------------------------------------------------------

fn random_gdo(n: usize) -> (Array2<f32>, Array1<f32>) {
    let mut rng = rand::thread_rng();
    let probs = Array2::from_shape_fn((2, n), |(i, _)| {
        let center = if i == 0 { 0.09 } else { 0.49 };
        center + rng.gen_range(-0.05..0.05)
    });
    let confs = Array1::from_shape_fn(n, |_| 0.5 + rng.gen_range(-0.1..0.1));
    (probs, confs)
}

fn create_repository(gateway: &Gateway, repository: &GdoRepository, n: usize) -> String {
    let set_vid = vid::make_vid();
    let result = repository.create_repository(gateway, &set_vid, n);
    assert!(result.is_ok(), "Failed to create a repository: {}", result.unwrap_err());
    set_vid
}

fn append(gateway: &Gateway, repository: &GdoRepository, set_vid: &str, probs: &Array2<f32>, confs: &Array1<f32>) -> String {
    let result = repository.append(gateway, set_vid, probs, confs, "V1");
    assert!(result.is_ok(), "Failed to append a GDO: {}", result.unwrap_err());
    result.unwrap()
}

fn get(gateway: &Gateway, repository: &GdoRepository, set_vid: &str, gdo_vid: &str) -> Gdo {
    let result = repository.get(gateway, set_vid, gdo_vid);
    assert!(result.is_ok(), "Failed to get GDO {}: {}", gdo_vid, result.unwrap_err());
    result.unwrap()
}

//-----------------------------------------------------------------------------

#[test]
fn packing() {
    let values = [0.25_f32, -1.5, 3.0e-7, 0.0];
    let bytes = pack(values.iter());
    assert_eq!(bytes.len(), 16);
    assert_eq!(&bytes[0..4], &0.25_f32.to_le_bytes());
    assert_eq!(unpack(&bytes, 16).unwrap(), values.to_vec());

    // Short values are padded with zeros.
    assert_eq!(unpack(&bytes[..4], 16).unwrap(), vec![0.25, 0.0, 0.0, 0.0]);
    assert_eq!(unpack(&[], 8).unwrap(), vec![0.0, 0.0]);

    assert!(unpack(&bytes, 12).is_err(), "Unpacked a value wider than the column");
    assert!(unpack(&bytes[..4], 6).is_err(), "Accepted a width that is not a multiple of 4");
}

#[test]
fn append_and_get() {
    let (_dir, gateway) = internal::create_gateway();
    let repository = GdoRepository::new();
    let n = 10;
    let set_vid = create_repository(&gateway, &repository, n);

    let mut written = Vec::new();
    for _ in 0..10 {
        let (probs, confs) = random_gdo(n);
        let gdo_vid = append(&gateway, &repository, &set_vid, &probs, &confs);
        written.push((gdo_vid, probs, confs));
    }
    assert_eq!(repository.count(&gateway, &set_vid).unwrap(), 10);

    for (i, (gdo_vid, probs, confs)) in written.iter().enumerate().rev() {
        let gdo = get(&gateway, &repository, &set_vid, gdo_vid);
        assert_eq!(gdo.vid, *gdo_vid);
        assert_eq!(gdo.set_vid, set_vid);
        assert_eq!(gdo.row_id, i, "Wrong row for GDO {}", i);
        assert_eq!(gdo.op_vid, "V1");
        assert_eq!(gdo.probs.dim(), (2, n));
        assert_eq!(gdo.len(), n);
        assert_eq!(gdo.probs, *probs, "Wrong probabilities for GDO {}", i);
        assert_eq!(gdo.confs, *confs, "Wrong confidences for GDO {}", i);
    }

    // The index is rebuilt after an append.
    let (probs, confs) = random_gdo(n);
    let gdo_vid = append(&gateway, &repository, &set_vid, &probs, &confs);
    assert_eq!(get(&gateway, &repository, &set_vid, &gdo_vid).row_id, 10);

    let missing = vid::make_vid();
    assert!(matches!(repository.get(&gateway, &set_vid, &missing), Err(KBError::NotFound(_))));
    assert!(matches!(repository.get(&gateway, &missing, &gdo_vid), Err(KBError::MissingTable(_))));
    assert_eq!(gateway.open_sessions(), 0);
}

#[test]
fn trailing_zeros() {
    let (_dir, gateway) = internal::create_gateway();
    let repository = GdoRepository::new();
    let n = 10;
    let set_vid = create_repository(&gateway, &repository, n);

    let (mut probs, mut confs) = random_gdo(n);
    for j in (n - 4)..n {
        probs[[1, j]] = 0.0;
        confs[j] = 0.0;
    }
    let gdo_vid = append(&gateway, &repository, &set_vid, &probs, &confs);

    // The stored values are shorter than the columns.
    let stored = gateway.with_tables(|tables| {
        let table = tables.get_table(&schema::gdo_table_name(&set_vid))?;
        tables.read_row(&table, 0)
    }).unwrap().unwrap();
    assert_eq!(stored[2].as_bytes().map(|x| x.len()), Some((2 * n - 4) * 4));
    assert_eq!(stored[3].as_bytes().map(|x| x.len()), Some((n - 4) * 4));

    let gdo = get(&gateway, &repository, &set_vid, &gdo_vid);
    assert_eq!(gdo.probs.dim(), (2, n));
    assert_eq!(gdo.confs.len(), n);
    assert_eq!(gdo.probs, probs);
    assert_eq!(gdo.confs, confs);
    for j in (n - 4)..n {
        assert_eq!(gdo.probs[[1, j]], 0.0);
        assert_eq!(gdo.confs[j], 0.0);
    }
}

#[test]
fn single_marker() {
    let (_dir, gateway) = internal::create_gateway();
    let repository = GdoRepository::new();
    let set_vid = create_repository(&gateway, &repository, 1);

    let probs = Array2::from_shape_vec((2, 1), vec![0.9_f32, 0.1]).unwrap();
    let confs = Array1::from_vec(vec![0.75_f32]);
    let gdo_vid = append(&gateway, &repository, &set_vid, &probs, &confs);
    let gdo = get(&gateway, &repository, &set_vid, &gdo_vid);
    assert_eq!(gdo.probs, probs);
    assert_eq!(gdo.confs, confs);

    let streamed: Vec<Gdo> = repository.stream(&gateway, &set_vid, 4).unwrap().map(|x| x.unwrap()).collect();
    assert_eq!(streamed, vec![gdo]);

    // All zeros are stored as empty values.
    let zeros = Array2::zeros((2, 1));
    let gdo_vid = append(&gateway, &repository, &set_vid, &zeros, &Array1::zeros(1));
    let gdo = get(&gateway, &repository, &set_vid, &gdo_vid);
    assert_eq!(gdo.probs, zeros);
}

#[test]
fn width_mismatch() {
    let (_dir, gateway) = internal::create_gateway();
    let repository = GdoRepository::new();
    let set_vid = create_repository(&gateway, &repository, 10);

    for n in [9, 11] {
        let (probs, confs) = random_gdo(n);
        let result = repository.append(&gateway, &set_vid, &probs, &confs, "V1");
        assert!(matches!(result, Err(KBError::Invariant(_))), "Appended a GDO with {} markers", n);
    }
    let (probs, _) = random_gdo(10);
    let (_, confs) = random_gdo(9);
    assert!(matches!(repository.append(&gateway, &set_vid, &probs, &confs, "V1"), Err(KBError::Invariant(_))));
    let transposed = Array2::zeros((10, 2));
    assert!(matches!(repository.append(&gateway, &set_vid, &transposed, &Array1::zeros(10), "V1"), Err(KBError::Invariant(_))));

    assert_eq!(repository.count(&gateway, &set_vid).unwrap(), 0);
    assert_eq!(gateway.open_sessions(), 0, "A failed append left the session open");

    // Repositories cannot be recreated or empty.
    assert!(repository.create_repository(&gateway, &set_vid, 10).is_err());
    assert!(repository.create_repository(&gateway, &vid::make_vid(), 0).is_err());
}

#[test]
fn streaming() {
    let (_dir, gateway) = internal::create_gateway();
    let repository = GdoRepository::new();
    let n = 10;
    let set_vid = create_repository(&gateway, &repository, n);

    // An empty repository yields nothing.
    let mut stream = repository.stream(&gateway, &set_vid, 4).unwrap();
    assert!(stream.next().is_none());
    assert!(!stream.is_open());
    drop(stream);

    let mut written = Vec::new();
    for _ in 0..10 {
        let (probs, confs) = random_gdo(n);
        written.push((append(&gateway, &repository, &set_vid, &probs, &confs), probs, confs));
    }

    let opened = gateway.sessions_opened();
    let mut stream = repository.stream(&gateway, &set_vid, 4).unwrap();
    assert_eq!(gateway.open_sessions(), 1);
    let mut count = 0;
    for (i, gdo) in stream.by_ref().enumerate() {
        let gdo = gdo.unwrap();
        let (gdo_vid, probs, confs) = &written[i];
        assert_eq!(gdo.vid, *gdo_vid, "Wrong GDO at position {}", i);
        assert_eq!(gdo.row_id, i);
        assert_eq!(gdo.probs, *probs);
        assert_eq!(gdo.confs, *confs);
        count += 1;
    }
    assert_eq!(count, 10);
    assert!(!stream.is_open(), "The stream kept its session after the last GDO");
    assert_eq!(gateway.open_sessions(), 0);
    assert_eq!(gateway.sessions_opened(), opened + 1, "The stream used more than one session");

    // Dropping a partially consumed stream closes the session.
    let mut stream = repository.stream(&gateway, &set_vid, 3).unwrap();
    assert!(stream.next().is_some());
    assert_eq!(gateway.open_sessions(), 1);
    drop(stream);
    assert_eq!(gateway.open_sessions(), 0);

    assert!(repository.stream(&gateway, &set_vid, 0).is_err());
    assert!(matches!(repository.stream(&gateway, &vid::make_vid(), 4), Err(KBError::MissingTable(_))));
    assert_eq!(gateway.open_sessions(), 0);
}

#[test]
fn drop_repository() {
    let (_dir, gateway) = internal::create_gateway();
    let repository = GdoRepository::new();
    let set_vid = create_repository(&gateway, &repository, 3);
    let (probs, confs) = random_gdo(3);
    let gdo_vid = append(&gateway, &repository, &set_vid, &probs, &confs);
    let _ = get(&gateway, &repository, &set_vid, &gdo_vid);

    assert!(repository.exists(&gateway, &set_vid).unwrap());
    assert!(repository.drop_repository(&gateway, &set_vid).unwrap());
    assert!(!repository.exists(&gateway, &set_vid).unwrap());
    assert!(!repository.drop_repository(&gateway, &set_vid).unwrap());
    assert!(matches!(repository.get(&gateway, &set_vid, &gdo_vid), Err(KBError::MissingTable(_))));

    // A new repository for the same set starts empty.
    assert!(repository.create_repository(&gateway, &set_vid, 3).is_ok());
    assert_eq!(repository.count(&gateway, &set_vid).unwrap(), 0);
    assert!(matches!(repository.get(&gateway, &set_vid, &gdo_vid), Err(KBError::NotFound(_))));
}

//-----------------------------------------------------------------------------
